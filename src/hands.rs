use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::session::{BrowserSession, PageInfo, RawSnapshot};
use crate::types::{ID_ATTRIBUTE, ScrollDirection};

const DEBUG_PORT_URL: &str = "http://127.0.0.1:9222";
const SETTLE_POLL: Duration = Duration::from_millis(250);

/// Injected into the page to tag and describe interactive elements.
///
/// Read-only apart from the `data-usagi-id` attributes: previous tags are removed and
/// every interactive element is re-tagged `e0`, `e1`, ... in document order, so an
/// unchanged page gets the same ids on every extraction.
const SNAPSHOT_JS: &str = r#"
(() => {
  const ATTR = 'data-usagi-id';
  document.querySelectorAll('[' + ATTR + ']').forEach(el => el.removeAttribute(ATTR));
  const SELECTOR = 'a,button,input,textarea,select,[role=button],[role=link],[role=tab],[role=menuitem],[onclick]';
  const NON_FILL_INPUTS = ['button','submit','reset','image','checkbox','radio','file'];
  const IMPLICIT_ROLES = {a:'link', button:'button', select:'combobox', textarea:'textbox', input:'textbox'};
  const elements = [];
  let id = 0;
  for (const el of document.querySelectorAll(SELECTOR)) {
    const tag = el.tagName.toLowerCase();
    const type = (el.getAttribute('type') || '').toLowerCase();
    if (tag === 'input' && type === 'hidden') continue;
    const fillable = tag === 'textarea' || tag === 'select' || (tag === 'input' && !NON_FILL_INPUTS.includes(type));
    const rect = el.getBoundingClientRect();
    const label = (el.textContent || '').trim() || el.getAttribute('aria-label') || el.getAttribute('title')
      || el.getAttribute('placeholder') || el.getAttribute('alt') || el.getAttribute('name') || '';
    const eid = 'e' + (id++);
    el.setAttribute(ATTR, eid);
    elements.push({
      id: eid,
      kind: fillable ? 'fillable' : 'clickable',
      tag: tag,
      role: el.getAttribute('role') || (tag === 'input' && NON_FILL_INPUTS.includes(type) ? 'button' : (IMPLICIT_ROLES[tag] || '')),
      text: label.slice(0, 400),
      has_box: rect.width > 0 && rect.height > 0,
      enabled: !el.disabled && el.getAttribute('aria-disabled') !== 'true',
      href: tag === 'a' && el.href ? el.href : null,
      value: fillable ? String(el.value || '').slice(0, 60) : null,
    });
    if (id >= 200) break;
  }
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK']);
  const lines = [];
  const seen = new Set();
  function walk(node, depth) {
    if (depth > 15) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (child.children.length === 0) {
        const t = (child.textContent || '').trim();
        if (t.length > 2 && t.length < 200 && !seen.has(t)) { seen.add(t); lines.push(t); }
      }
      walk(child, depth + 1);
    }
  }
  if (document.body) walk(document.body, 0);
  return JSON.stringify({elements: elements, text: lines.join('\n').slice(0, 8000)});
})()
"#;

const LOCATION_JS: &str = r#"JSON.stringify({url: String(location.href), title: document.title || '', ready: document.readyState, nodes: document.getElementsByTagName('*').length})"#;

#[derive(Debug, Deserialize)]
struct LocationProbe {
    url: String,
    title: String,
    ready: String,
    nodes: u64,
}

/// Options for [`ChromeSession::launch`].
#[derive(Debug, Clone, Default)]
pub struct ChromeOptions {
    pub headless: bool,
    /// Chrome binary; `None` lets headless_chrome search the usual install locations.
    pub chrome_path: Option<PathBuf>,
    /// Profile directory; defaults to a persistent profile under the user's data dir.
    pub profile_dir: Option<PathBuf>,
    /// Try a Chrome already listening on port 9222 before launching one.
    pub attach: bool,
}

/// A Chrome tab driven through headless_chrome.
///
/// headless_chrome is blocking, so every call runs on `spawn_blocking` with its own
/// clone of the tab handle.
pub struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeSession {
    pub fn launch(options: &ChromeOptions) -> anyhow::Result<Self> {
        if options.attach {
            info!(endpoint = DEBUG_PORT_URL, "Attempting to attach to existing Chrome");
            match Browser::connect(DEBUG_PORT_URL.to_string()) {
                Ok(browser) => {
                    let existing = browser
                        .get_tabs()
                        .lock()
                        .map_err(|_| anyhow::anyhow!("Chrome tab list lock poisoned"))?
                        .first()
                        .cloned();
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab()?,
                    };
                    info!("Attached to existing Chrome");
                    return Ok(Self {
                        _browser: browser,
                        tab,
                    });
                }
                Err(e) => warn!(error = %e, "Could not attach, launching a new Chrome"),
            }
        }

        let profile = match &options.profile_dir {
            Some(dir) => dir.clone(),
            None => default_profile_dir()?,
        };
        std::fs::create_dir_all(&profile)?;
        debug!(profile = %profile.display(), "Using Chrome profile");

        let launch = LaunchOptions {
            headless: options.headless,
            path: options.chrome_path.clone(),
            user_data_dir: Some(profile),
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
                std::ffi::OsStr::new("--disable-infobars"),
                std::ffi::OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };

        let browser = Browser::new(launch)
            .map_err(|e| anyhow::anyhow!("Browser launch failed: {}", e))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!(headless = options.headless, "Chrome ready");

        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T, SessionError> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || op(&tab))
            .await
            .map_err(|e| SessionError::Other(format!("browser task failed: {e}")))?
    }
}

fn default_profile_dir() -> anyhow::Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("No local data directory for the Chrome profile"))?;
    Ok(base.join("usagi").join("chrome-profile"))
}

fn selector_for(element_id: &str) -> Result<String, SessionError> {
    let well_formed = !element_id.is_empty()
        && element_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !well_formed {
        return Err(SessionError::NoSuchElement(element_id.to_string()));
    }
    Ok(format!("[{ID_ATTRIBUTE}=\"{element_id}\"]"))
}

fn evaluate_string(tab: &Tab, js: &str) -> Result<String, SessionError> {
    let result = tab
        .evaluate(js, false)
        .map_err(|e| SessionError::Script(format!("{e:#}")))?;
    result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .ok_or_else(|| SessionError::Script("script returned no string".into()))
}

fn probe(tab: &Tab) -> Result<LocationProbe, SessionError> {
    let raw = evaluate_string(tab, LOCATION_JS).map_err(|_| SessionError::Detached)?;
    serde_json::from_str(&raw).map_err(|e| SessionError::Script(e.to_string()))
}

/// Confirms the element is still tagged before handing it to headless_chrome.
fn find_tagged<'a>(
    tab: &'a Tab,
    element_id: &str,
) -> Result<headless_chrome::Element<'a>, SessionError> {
    let selector = selector_for(element_id)?;
    let exists = tab
        .evaluate(&format!("!!document.querySelector('{selector}')"), false)
        .map_err(|e| SessionError::Script(format!("{e:#}")))?
        .value
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !exists {
        return Err(SessionError::NoSuchElement(element_id.to_string()));
    }
    tab.find_element(&selector)
        .map_err(|_| SessionError::NoSuchElement(element_id.to_string()))
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn load(&self, url: &str) -> Result<(), SessionError> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .map_err(|e| SessionError::Navigation(format!("{url}: {e:#}")))?;
            Ok(())
        })
        .await
    }

    async fn location(&self) -> Result<PageInfo, SessionError> {
        self.blocking(|tab| {
            let probe = probe(tab)?;
            if probe.url.is_empty() {
                return Err(SessionError::Detached);
            }
            Ok(PageInfo {
                url: probe.url,
                title: probe.title,
            })
        })
        .await
    }

    async fn query_elements(&self) -> Result<RawSnapshot, SessionError> {
        self.blocking(|tab| {
            let raw = evaluate_string(tab, SNAPSHOT_JS)?;
            serde_json::from_str(&raw).map_err(|e| SessionError::Script(e.to_string()))
        })
        .await
    }

    async fn click(&self, element_id: &str) -> Result<(), SessionError> {
        let element_id = element_id.to_string();
        self.blocking(move |tab| {
            let element = find_tagged(tab, &element_id)?;
            element
                .scroll_into_view()
                .and_then(|el| el.click())
                .map_err(|e| SessionError::Other(format!("click {element_id}: {e:#}")))?;
            Ok(())
        })
        .await
    }

    async fn type_text(&self, element_id: &str, text: &str) -> Result<(), SessionError> {
        let element_id = element_id.to_string();
        let text = text.to_string();
        self.blocking(move |tab| {
            let element = find_tagged(tab, &element_id)?;
            element
                .scroll_into_view()
                .and_then(|el| el.click())
                .map_err(|e| SessionError::Other(format!("focus {element_id}: {e:#}")))?;
            let selector = selector_for(&element_id)?;
            tab.evaluate(&format!("document.querySelector('{selector}').value = ''"), false)
                .map_err(|e| SessionError::Script(format!("{e:#}")))?;
            tab.type_str(&text)
                .map_err(|e| SessionError::Other(format!("type into {element_id}: {e:#}")))?;
            Ok(())
        })
        .await
    }

    async fn scroll(&self, direction: ScrollDirection) -> Result<(), SessionError> {
        let js = match direction {
            ScrollDirection::Up => "window.scrollBy(0, -window.innerHeight * 0.8)",
            ScrollDirection::Down => "window.scrollBy(0, window.innerHeight * 0.8)",
            ScrollDirection::Top => "window.scrollTo(0, 0)",
            ScrollDirection::Bottom => "window.scrollTo(0, document.body.scrollHeight)",
        };
        self.blocking(move |tab| {
            tab.evaluate(js, false)
                .map_err(|e| SessionError::Script(format!("{e:#}")))?;
            Ok(())
        })
        .await
    }

    async fn wait_settled(&self, timeout: Duration) -> Result<(), SessionError> {
        self.blocking(move |tab| {
            // Settled means readyState is complete and the node count held still for one poll.
            let deadline = Instant::now() + timeout;
            let mut last_nodes = None;
            loop {
                match probe(tab) {
                    Ok(p) if p.ready == "complete" => {
                        if last_nodes == Some(p.nodes) {
                            return Ok(());
                        }
                        last_nodes = Some(p.nodes);
                    }
                    Ok(_) => last_nodes = None,
                    Err(SessionError::Detached) => {}
                    Err(e) => return Err(e),
                }
                if Instant::now() >= deadline {
                    return Err(SessionError::Timeout(format!(
                        "page did not settle within {}ms",
                        timeout.as_millis()
                    )));
                }
                std::thread::sleep(SETTLE_POLL);
            }
        })
        .await
    }
}
