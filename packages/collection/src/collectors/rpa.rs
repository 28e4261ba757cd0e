//! Web-RPA collector.
//!
//! Drives a headless browser (CDP) to the configured URL, optionally
//! authenticating via manual cookies or a credentialed login sequence,
//! runs post-navigation actions, and extracts records from the rendered
//! HTML with CSS selectors.
//!
//! Navigation waits for `DOMContentLoaded` only — the full `load` event
//! is unreliable on heavy pages. A hard 30s ceiling lets partial HTML
//! through rather than failing the attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::EventDomContentEventFired;
use chromiumoxide::page::Page;
use futures::StreamExt;
use scraper::{Html, Selector};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CookieSpec, DataSourceConfig, LoginConfig, RpaAction, RpaConfig};
use crate::error::{CollectError, CollectResult};
use crate::record::Record;
use crate::traits::Collector;

use super::session::SessionCache;

/// Hard ceiling on the DOMContentLoaded wait.
const NAVIGATION_CEILING: Duration = Duration::from_secs(30);

/// How long to wait for the post-login anchor before assuming login
/// completed anyway.
const LOGIN_SETTLE: Duration = Duration::from_secs(3);

/// Default wait when an action waits on a selector without a budget.
const DEFAULT_SELECTOR_WAIT: Duration = Duration::from_secs(10);

/// Minimum normalized length for a priority content container to win
/// over the longest-block fallback.
const MIN_CONTENT_LEN: usize = 50;

/// Containers tried in order during heuristic main-content extraction.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "[role=main]",
    "main",
    ".article-content",
    ".post-content",
    ".entry-content",
    "#article",
    ".article",
    "#content",
    ".content",
];

/// Collector that renders pages in a headless browser.
pub struct RpaCollector {
    headless: bool,
    sessions: Arc<SessionCache>,
}

impl RpaCollector {
    pub fn new(headless: bool, sessions: Arc<SessionCache>) -> Self {
        Self { headless, sessions }
    }

    async fn launch(&self) -> CollectResult<(Browser, tokio::task::JoinHandle<()>)> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage");
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| CollectError::Browser(e.into()))?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(browser_err)?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok((browser, handler_task))
    }

    /// Navigate and wait for DOMContentLoaded, with ceiling and
    /// cancellation. Partial HTML is acceptable; only cancellation
    /// aborts.
    async fn navigate(
        &self,
        cancel: &CancellationToken,
        page: &Page,
        url: &str,
    ) -> CollectResult<()> {
        debug!(url = %url, "navigating");
        let mut dom_ready = page
            .event_listener::<EventDomContentEventFired>()
            .await
            .map_err(browser_err)?;

        page.goto(url).await.map_err(browser_err)?;

        tokio::select! {
            _ = dom_ready.next() => {
                debug!(url = %url, "DOM ready");
            }
            _ = tokio::time::sleep(NAVIGATION_CEILING) => {
                warn!(url = %url, "navigation ceiling reached, continuing with partial DOM");
            }
            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
        }

        Ok(())
    }

    async fn inject_cookies(
        &self,
        page: &Page,
        url: &str,
        cookies: &[CookieSpec],
    ) -> CollectResult<()> {
        if cookies.is_empty() {
            return Ok(());
        }

        let mut params = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            let mut builder = CookieParam::builder()
                .name(&cookie.name)
                .value(&cookie.value);
            if cookie.domain.is_empty() {
                builder = builder.url(url);
            } else {
                builder = builder.domain(&cookie.domain);
            }
            if !cookie.path.is_empty() {
                builder = builder.path(&cookie.path);
            }
            params.push(
                builder
                    .build()
                    .map_err(|e| CollectError::Browser(e.into()))?,
            );
        }

        page.set_cookies(params).await.map_err(browser_err)?;
        debug!(count = cookies.len(), "cookies injected");
        Ok(())
    }

    async fn capture_cookies(&self, page: &Page) -> CollectResult<Vec<CookieSpec>> {
        let cookies = page.get_cookies().await.map_err(browser_err)?;
        Ok(cookies
            .into_iter()
            .map(|c| CookieSpec {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
            })
            .collect())
    }

    /// Poll for a selector until it appears or the budget runs out.
    async fn wait_for_selector(
        &self,
        cancel: &CancellationToken,
        page: &Page,
        selector: &str,
        budget: Duration,
    ) -> CollectResult<bool> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    /// Rendered-page check for an authenticated state.
    async fn is_logged_in(&self, page: &Page, check_selector: &str) -> CollectResult<bool> {
        let html = page.content().await.map_err(browser_err)?;
        html_has_selector(&html, check_selector)
    }

    /// Execute the credentialed login sequence and capture the resulting
    /// cookies into the session cache.
    async fn perform_login(
        &self,
        cancel: &CancellationToken,
        page: &Page,
        host: &str,
        url: &str,
        login: &LoginConfig,
    ) -> CollectResult<()> {
        let login_url = login.login_url.as_deref().unwrap_or(url);
        info!(host = %host, "performing login");
        self.navigate(cancel, page, login_url).await?;

        if !self
            .wait_for_selector(cancel, page, &login.username_selector, DEFAULT_SELECTOR_WAIT)
            .await?
        {
            return Err(CollectError::LoginFailed {
                host: host.to_string(),
                reason: format!("username field {} never appeared", login.username_selector),
            });
        }

        self.clear_field(page, &login.username_selector).await?;
        self.type_into(page, &login.username_selector, &login.username)
            .await?;
        self.clear_field(page, &login.password_selector).await?;
        self.type_into(page, &login.password_selector, &login.password)
            .await?;

        page.find_element(&login.submit_selector)
            .await
            .map_err(browser_err)?
            .click()
            .await
            .map_err(browser_err)?;

        match &login.success_selector {
            Some(anchor) => {
                if !self
                    .wait_for_selector(cancel, page, anchor, LOGIN_SETTLE)
                    .await?
                {
                    debug!(host = %host, "post-login anchor not seen, assuming settled");
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                    _ = tokio::time::sleep(LOGIN_SETTLE) => {}
                }
            }
        }

        let cookies = self.capture_cookies(page).await?;
        self.sessions.save(host, cookies);
        info!(host = %host, "login completed, session cached");
        Ok(())
    }

    async fn clear_field(&self, page: &Page, selector: &str) -> CollectResult<()> {
        let js = format!(
            "(() => {{ const el = document.querySelector({sel}); if (el) el.value = ''; }})()",
            sel = js_string(selector)
        );
        page.evaluate(js).await.map_err(browser_err)?;
        Ok(())
    }

    async fn type_into(&self, page: &Page, selector: &str, text: &str) -> CollectResult<()> {
        page.find_element(selector)
            .await
            .map_err(browser_err)?
            .click()
            .await
            .map_err(browser_err)?
            .type_str(text)
            .await
            .map_err(browser_err)?;
        Ok(())
    }

    async fn run_actions(
        &self,
        cancel: &CancellationToken,
        page: &Page,
        actions: &[RpaAction],
    ) -> CollectResult<()> {
        for action in actions {
            match action {
                RpaAction::Input { selector, value } => {
                    self.clear_field(page, selector).await?;
                    self.type_into(page, selector, value).await?;
                }
                RpaAction::Click { selector } => {
                    page.find_element(selector)
                        .await
                        .map_err(browser_err)?
                        .click()
                        .await
                        .map_err(browser_err)?;
                }
                RpaAction::Select { selector, value } => {
                    let js = format!(
                        "(() => {{ const el = document.querySelector({sel}); \
                         if (el) {{ el.value = {val}; \
                         el.dispatchEvent(new Event('change', {{bubbles: true}})); }} }})()",
                        sel = js_string(selector),
                        val = js_string(value)
                    );
                    page.evaluate(js).await.map_err(browser_err)?;
                }
                RpaAction::Wait { ms, wait_for } => match wait_for {
                    Some(selector) => {
                        let budget = if *ms > 0 {
                            Duration::from_millis(*ms)
                        } else {
                            DEFAULT_SELECTOR_WAIT
                        };
                        self.wait_for_selector(cancel, page, selector, budget).await?;
                    }
                    None => {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                            _ = tokio::time::sleep(Duration::from_millis(*ms)) => {}
                        }
                    }
                },
            }
        }
        Ok(())
    }

    /// Authenticate and land on the target URL according to the RPA
    /// sub-config: no login, manual cookies, or credentialed login with
    /// session reuse.
    async fn authenticate_and_navigate(
        &self,
        cancel: &CancellationToken,
        page: &Page,
        host: &str,
        config: &DataSourceConfig,
        rpa: Option<&RpaConfig>,
    ) -> CollectResult<()> {
        let Some(rpa) = rpa else {
            return self.navigate(cancel, page, &config.url).await;
        };

        if let Some(login) = &rpa.login {
            // Fresh cached session skips the login sequence entirely.
            if let Some(cookies) = self.sessions.load(host) {
                debug!(host = %host, "reusing cached session cookies");
                self.inject_cookies(page, &config.url, &cookies).await?;
                self.navigate(cancel, page, &config.url).await?;

                match &rpa.check_selector {
                    Some(check) if !self.is_logged_in(page, check).await? => {
                        info!(host = %host, "cached session rejected, logging in again");
                        self.perform_login(cancel, page, host, &config.url, login)
                            .await?;
                        self.navigate(cancel, page, &config.url).await?;
                    }
                    _ => {}
                }
                return Ok(());
            }

            self.perform_login(cancel, page, host, &config.url, login)
                .await?;
            return self.navigate(cancel, page, &config.url).await;
        }

        let mut cookies = rpa.initial_cookies.clone();
        if let Some(raw) = &rpa.cookie_string {
            cookies.extend(parse_cookie_string(raw));
        }

        if !cookies.is_empty() {
            self.inject_cookies(page, &config.url, &cookies).await?;
            self.navigate(cancel, page, &config.url).await?;

            if let Some(check) = &rpa.check_selector {
                if !self.is_logged_in(page, check).await? {
                    return Err(CollectError::SessionExpired {
                        host: host.to_string(),
                    });
                }
            }
            return Ok(());
        }

        self.navigate(cancel, page, &config.url).await
    }
}

#[async_trait]
impl Collector for RpaCollector {
    fn type_tag(&self) -> &'static str {
        "web-rpa"
    }

    async fn collect(
        &self,
        cancel: &CancellationToken,
        config: &DataSourceConfig,
    ) -> CollectResult<Vec<Record>> {
        info!(url = %config.url, "RPA collection starting");

        let host = url::Url::parse(&config.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| CollectError::InvalidUrl {
                url: config.url.clone(),
            })?;

        let (mut browser, handler_task) = self.launch().await?;

        let result = async {
            let page = browser
                .new_page("about:blank")
                .await
                .map_err(browser_err)?;

            self.authenticate_and_navigate(cancel, &page, &host, config, config.rpa_config.as_ref())
                .await?;

            if let Some(rpa) = &config.rpa_config {
                self.run_actions(cancel, &page, &rpa.actions).await?;
            }

            let html = page.content().await.map_err(browser_err)?;
            parse_html(&html, &config.selectors)
        }
        .await;

        let _ = browser.close().await;
        let _ = handler_task.await;

        let records = result?;
        info!(url = %config.url, records = records.len(), "RPA collection completed");
        Ok(records)
    }
}

fn browser_err(e: impl std::error::Error + Send + Sync + 'static) -> CollectError {
    CollectError::Browser(Box::new(e))
}

/// JSON-escape a string for embedding in evaluated JavaScript.
fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// Parse a raw `name=value; name2=value2` cookie header.
fn parse_cookie_string(raw: &str) -> Vec<CookieSpec> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some(CookieSpec {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
                domain: String::new(),
                path: String::new(),
            })
        })
        .collect()
}

fn parse_selector(selector: &str) -> CollectResult<Selector> {
    Selector::parse(selector).map_err(|_| CollectError::InvalidSelector {
        selector: selector.to_string(),
    })
}

fn html_has_selector(html: &str, selector: &str) -> CollectResult<bool> {
    let parsed = parse_selector(selector)?;
    let document = Html::parse_document(html);
    Ok(document.select(&parsed).next().is_some())
}

/// Extract records from rendered HTML.
///
/// With `_list`, every matched container yields one record, reading each
/// configured field selector inside it. Without `_list`, one record is
/// read from the whole document. An empty selector map falls back to
/// heuristic main-content extraction.
///
/// A field selector may end in `@attr` to read an attribute instead of
/// text (`a.title@href`). A field whose matched element carries an
/// `href` and no text also yields the `href`.
fn parse_html(html: &str, selectors: &HashMap<String, String>) -> CollectResult<Vec<Record>> {
    let field_selectors: Vec<(&String, &String)> = selectors
        .iter()
        .filter(|(field, _)| field.as_str() != "_list")
        .collect();

    if field_selectors.is_empty() {
        return Ok(vec![extract_main_content(html)]);
    }

    let document = Html::parse_document(html);

    if let Some(list_selector) = selectors.get("_list") {
        let list = parse_selector(list_selector)?;
        let mut records = Vec::new();
        for container in document.select(&list) {
            let mut record = Record::new();
            for (field, selector) in &field_selectors {
                if let Some(value) = read_field(container, selector)? {
                    record.insert((*field).clone(), Value::String(value));
                }
            }
            records.push(record);
        }
        return Ok(records);
    }

    let root = document.root_element();
    let mut record = Record::new();
    for (field, selector) in &field_selectors {
        if let Some(value) = read_field(root, selector)? {
            record.insert((*field).clone(), Value::String(value));
        }
    }
    Ok(vec![record])
}

/// Read one field value relative to a container element.
fn read_field(
    container: scraper::ElementRef<'_>,
    selector: &str,
) -> CollectResult<Option<String>> {
    let (css, attr) = match selector.rsplit_once('@') {
        Some((css, attr)) if !css.is_empty() => (css, Some(attr)),
        _ => (selector, None),
    };

    let parsed = parse_selector(css)?;
    let Some(element) = container.select(&parsed).next() else {
        return Ok(None);
    };

    if let Some(attr) = attr {
        return Ok(element.value().attr(attr).map(str::to_string));
    }

    let text = normalize_whitespace(&element.text().collect::<String>());
    if text.is_empty() {
        if let Some(href) = element.value().attr("href") {
            return Ok(Some(href.to_string()));
        }
    }
    Ok(Some(text))
}

/// Heuristic extraction when no selectors are configured: page title plus
/// the main content block.
fn extract_main_content(html: &str) -> Record {
    let document = Html::parse_document(html);
    let mut record = Record::new();

    if let Ok(title_selector) = Selector::parse("title") {
        if let Some(title) = document.select(&title_selector).next() {
            let title = normalize_whitespace(&title.text().collect::<String>());
            if !title.is_empty() {
                record.insert("title".to_string(), Value::String(title));
            }
        }
    }

    // Priority containers first.
    for candidate in CONTENT_SELECTORS {
        let Ok(selector) = Selector::parse(candidate) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let text = normalize_whitespace(&visible_text(element));
            if text.len() >= MIN_CONTENT_LEN {
                record.insert("content".to_string(), Value::String(text));
                return record;
            }
        }
    }

    // Fall back to the longest paragraph or division block.
    let mut longest = String::new();
    if let Ok(selector) = Selector::parse("p, div") {
        for element in document.select(&selector) {
            let text = normalize_whitespace(&visible_text(element));
            if text.len() > longest.len() {
                longest = text;
            }
        }
    }

    record.insert("content".to_string(), Value::String(longest));
    record
}

/// Text content of an element, skipping script/style/chrome subtrees.
fn visible_text(element: scraper::ElementRef<'_>) -> String {
    const SKIP: &[&str] = &[
        "script", "style", "nav", "header", "footer", "aside", "noscript", "iframe", "form",
    ];

    let mut out = String::new();
    let mut stack: Vec<_> = element.children().collect();
    stack.reverse();

    while let Some(node) = stack.pop() {
        match node.value() {
            scraper::Node::Text(text) => out.push_str(&text.text),
            scraper::Node::Element(el) => {
                if !SKIP.contains(&el.name()) {
                    let mut children: Vec<_> = node.children().collect();
                    children.reverse();
                    stack.append(&mut children);
                }
            }
            _ => {}
        }
    }
    out
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
