//! Static HTML scraper family (spec.md §4.6.3). Grounded on
//! `examples/original_source/src/collectors/scrapper.py::schedule`/`collect`:
//! page-hash-memoized single fetch per tick, CSS or XPath selection (XPath
//! selectors start with `//` or `./`), joined matched text, per-field
//! transform, store. Selection across fields runs on the `rayon` worker
//! pool once every page is fetched, matching the Python source's
//! `asyncio.to_thread`-dispatched selection loop.

use std::sync::Arc;

use chomp_core::{FieldValue, Ingester};
use log::error;
use rayon::prelude::*;
use scraper::{Html, Selector};
use sxd_document::parser as xml_parser;
use sxd_xpath::{Context as XPathContext, Factory};
use tokio::sync::Mutex;

use crate::context::Context;
use crate::families::{ensure_claim, route_cache, substitute_fields};
use crate::scheduler::Job;
use crate::store::transform_and_store;

fn is_xpath(selector: &str) -> bool {
    selector.starts_with("//") || selector.starts_with("./")
}

/// Builds the single recurring job this ingester contributes to its cron
/// slot. The Ingester lives behind one `Arc<Mutex<_>>` owned by this job
/// alone (spec.md §5); the page-hash cache is reset at the top of every tick,
/// matching the Python `soup_by_page`/`tree_by_page` local dicts.
pub fn schedule(ctx: Context, ingester: Ingester) -> Job {
    let id = ingester.id.clone();
    let state = Arc::new(Mutex::new(ingester));
    let cache = route_cache::<String>();

    Arc::new(move || {
        let ctx = ctx.clone();
        let id = id.clone();
        let cache = cache.clone();
        let state = state.clone();
        Box::pin(async move {
            let mut ingester = state.lock().await;
            let interval = ingester.interval;
            if !matches!(ensure_claim(&ctx, &id, interval).await, Ok(true)) {
                return;
            }
            collect(&ctx, &mut ingester, &cache).await;
        })
    })
}

/// One field resolved to its fetched page, awaiting selection.
struct Pending {
    field_index: usize,
    url: String,
    selector: String,
    page: String,
}

async fn collect(ctx: &Context, ingester: &mut Ingester, cache: &crate::families::RouteCache<String>) {
    cache.lock().await.clear();
    let ttl_secs = ingester.interval.to_seconds().max(1) as u64;

    let mut pending = Vec::with_capacity(ingester.fields.len());
    for i in 0..ingester.fields.len() {
        let Some(target) = ingester.fields[i].target.clone() else {
            continue;
        };
        let Some(selector) = ingester.fields[i].selector.clone() else {
            error!("missing selector for field scrapper {}.{}, skipping", ingester.name, ingester.fields[i].name);
            continue;
        };

        let url = substitute_fields(&target, ingester);
        let page_hash = blake3::hash(format!("{url}:{}", ingester.interval.symbol()).as_bytes())
            .to_hex()
            .to_string();

        let cached = cache.lock().await.get(&page_hash).cloned();
        let page = match cached {
            Some(page) => page,
            None => {
                let text = match ctx
                    .coordination
                    .get_or_set(&page_hash, ttl_secs, || {
                        let http = ctx.http.clone();
                        let url = url.clone();
                        async move { chomp_core::fetch::fetch_text(&http, &url).await.ok() }
                    })
                    .await
                {
                    Ok(Some(text)) => text,
                    Ok(None) => {
                        error!("failed to fetch page {url}, skipping field {}", ingester.fields[i].name);
                        continue;
                    }
                    Err(e) => {
                        error!("coordination store error fetching {url}: {e}");
                        continue;
                    }
                };
                cache.lock().await.insert(page_hash.clone(), text.clone());
                text
            }
        };

        pending.push(Pending { field_index: i, url, selector, page });
    }

    // Selection across fields sharing a fetched page runs on the rayon
    // worker pool, since CSS/XPath matching is pure CPU work once the page
    // text is in hand (spec.md §4.6.1).
    let selected: Vec<(usize, String, Option<String>)> = pending
        .into_par_iter()
        .map(|p| {
            let text = if is_xpath(&p.selector) { scrape_xpath(&p.page, &p.selector) } else { scrape_css(&p.page, &p.selector) };
            (p.field_index, p.url, text)
        })
        .collect();

    for (i, url, text) in selected {
        let Some(text) = text else {
            error!("no elements matched selector for field {}, page {url}, skipping", ingester.fields[i].name);
            continue;
        };
        ingester.fields[i].value = FieldValue::from_json(ingester.fields[i].ty, &serde_json::Value::String(text));
    }

    transform_and_store(ingester, ctx.tsdb.as_ref(), &ctx.coordination).await;
}

/// Joins the text content of every CSS match, newline-separated, matching
/// the Python `"\n".join([e.get_text().lstrip() for e in elements])`.
fn scrape_css(page: &str, selector: &str) -> Option<String> {
    let parsed = Selector::parse(selector).ok()?;
    let document = Html::parse_document(page);
    let mut texts = Vec::new();
    for el in document.select(&parsed) {
        let joined: String = el.text().collect();
        texts.push(joined.trim_start().to_string());
    }
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

/// Evaluates an XPath node-set selector against the page, joining each
/// matched node's string value.
fn scrape_xpath(page: &str, selector: &str) -> Option<String> {
    let package = xml_parser::parse(page).ok()?;
    let document = package.as_document();
    let factory = Factory::new();
    let xpath = factory.build(selector).ok()??;
    let context = XPathContext::new();
    let value = xpath.evaluate(&context, document.root()).ok()?;
    match value {
        sxd_xpath::Value::Nodeset(nodes) => {
            let texts: Vec<String> = nodes
                .document_order()
                .iter()
                .map(|n| n.string_value().trim_start().to_string())
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        other => Some(other.string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_xpath_detects_slash_prefixes() {
        assert!(is_xpath("//div[@class='price']"));
        assert!(is_xpath("./span"));
        assert!(!is_xpath("div.price"));
        assert!(!is_xpath("#price"));
    }

    #[test]
    fn scrape_css_joins_matched_text() {
        let page = "<html><body><span class=\"p\">1.23</span><span class=\"p\">4.56</span></body></html>";
        let text = scrape_css(page, "span.p").unwrap();
        assert_eq!(text, "1.23\n4.56");
    }

    #[test]
    fn scrape_css_none_when_no_match() {
        assert!(scrape_css("<html><body></body></html>", ".missing").is_none());
    }

    #[test]
    fn scrape_xpath_joins_matched_text() {
        let page = "<root><item>1.23</item><item>4.56</item></root>";
        let text = scrape_xpath(page, "//item").unwrap();
        assert_eq!(text, "1.23\n4.56");
    }

    #[test]
    fn scrape_xpath_none_when_no_match() {
        let page = "<root><item>1.23</item></root>";
        assert!(scrape_xpath(page, "//missing").is_none());
    }
}
