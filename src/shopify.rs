//! Shopify Admin API client.
//!
//! REST/JSON against a single store. `fetch_inventory_levels` pages the
//! product catalog and flattens variants into SKU-keyed records;
//! `set_inventory_level` mutates one inventory level and is the
//! `UpdateSink` used by dispatch. Rate-limit compliance is reactive: a
//! 429 surfaces as `RateLimited` for the dispatch retry loop, and the
//! call-limit header drives adaptive pacing between update calls.

use crate::config::ShopifyCredentials;
use crate::error::ApiError;
use crate::sync::{InventoryRecord, UpdateSink};
use serde::Deserialize;
use std::thread;
use std::time::Duration;

const API_VERSION: &str = "2023-04";
const PAGE_LIMIT: u32 = 250;

const MIN_PACING: Duration = Duration::from_millis(500);
const MAX_PACING: Duration = Duration::from_millis(2000);
const PACING_STEP_UP: Duration = Duration::from_millis(500);
const PACING_STEP_DOWN: Duration = Duration::from_millis(100);

pub struct ShopifyClient<'a> {
    agent: &'a ureq::Agent,
    credentials: &'a ShopifyCredentials,
    /// Inter-call delay, adjusted from the call-limit header.
    pacing: Duration,
}

#[derive(Deserialize)]
struct ProductsPage {
    products: Vec<Product>,
}

#[derive(Deserialize)]
struct Product {
    variants: Vec<Variant>,
}

#[derive(Deserialize)]
struct Variant {
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    inventory_item_id: Option<u64>,
    #[serde(default)]
    inventory_quantity: i64,
}

impl<'a> ShopifyClient<'a> {
    pub fn new(agent: &'a ureq::Agent, credentials: &'a ShopifyCredentials) -> Self {
        ShopifyClient {
            agent,
            credentials,
            pacing: MIN_PACING,
        }
    }

    /// Page through the product catalog and flatten variants into
    /// inventory records. Variants without a SKU cannot join the stock
    /// snapshot and are dropped.
    pub fn fetch_inventory_levels(&mut self) -> Result<Vec<InventoryRecord>, ApiError> {
        let mut records = Vec::new();
        let mut page_info: Option<String> = None;
        loop {
            let url = match &page_info {
                Some(cursor) => format!(
                    "https://{}/admin/api/{API_VERSION}/products.json?limit={PAGE_LIMIT}&page_info={cursor}",
                    self.credentials.shop_url
                ),
                None => format!(
                    "https://{}/admin/api/{API_VERSION}/products.json?limit={PAGE_LIMIT}&fields=id,variants",
                    self.credentials.shop_url
                ),
            };

            let mut response = self
                .agent
                .get(url.as_str())
                .header("X-Shopify-Access-Token", self.credentials.access_token.as_str())
                .call()
                .map_err(|err| ApiError::Network(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_error(status.as_u16(), None, "fetch products"));
            }

            let next = response
                .headers()
                .get("link")
                .and_then(|value| value.to_str().ok())
                .and_then(next_page_info);

            let page: ProductsPage = response
                .body_mut()
                .read_json()
                .map_err(|err| ApiError::Parse(err.to_string()))?;
            for product in page.products {
                for variant in product.variants {
                    let Some(sku) = variant.sku.filter(|sku| !sku.trim().is_empty()) else {
                        continue;
                    };
                    let Some(item_id) = variant.inventory_item_id else {
                        continue;
                    };
                    records.push(InventoryRecord {
                        sku,
                        variant_id: item_id.to_string(),
                        quantity: variant.inventory_quantity.clamp(0, i64::from(u32::MAX))
                            as u32,
                    });
                }
            }

            match next {
                Some(cursor) => page_info = Some(cursor),
                None => break,
            }
        }
        tracing::info!(records = records.len(), "inventory snapshot fetched");
        Ok(records)
    }

    fn adjust_pacing(&mut self, call_limit: Option<&str>) {
        let Some((used, limit)) = call_limit.and_then(parse_call_limit) else {
            return;
        };
        let usage = used as f64 / limit as f64;
        if usage > 0.8 {
            self.pacing = (self.pacing + PACING_STEP_UP).min(MAX_PACING);
        } else if usage < 0.5 {
            self.pacing = self.pacing.saturating_sub(PACING_STEP_DOWN).max(MIN_PACING);
        }
    }
}

impl UpdateSink for ShopifyClient<'_> {
    fn set_inventory_level(&mut self, variant_id: &str, quantity: u32) -> Result<(), ApiError> {
        let inventory_item_id: u64 = variant_id
            .parse()
            .map_err(|_| ApiError::Parse(format!("invalid variant id: {variant_id}")))?;

        // Calls are already serial; pacing just keeps us clear of the
        // bucket between consecutive updates.
        thread::sleep(self.pacing);

        let url = format!(
            "https://{}/admin/api/{API_VERSION}/inventory_levels/set.json",
            self.credentials.shop_url
        );
        let mut response = self
            .agent
            .post(url.as_str())
            .header("X-Shopify-Access-Token", self.credentials.access_token.as_str())
            .send_json(serde_json::json!({
                "location_id": self.credentials.location_id,
                "inventory_item_id": inventory_item_id,
                "available": quantity,
            }))
            .map_err(|err| ApiError::Network(err.to_string()))?;

        let call_limit = response
            .headers()
            .get("X-Shopify-Shop-Api-Call-Limit")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.adjust_pacing(call_limit.as_deref());

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f64>().ok())
            .map(Duration::from_secs_f64);
        let body = response
            .body_mut()
            .read_to_string()
            .unwrap_or_default();
        Err(status_error(
            status.as_u16(),
            retry_after,
            truncate(&body, 200),
        ))
    }
}

fn status_error(status: u16, retry_after: Option<Duration>, detail: &str) -> ApiError {
    match status {
        429 => ApiError::RateLimited { retry_after },
        401 | 403 => ApiError::Authentication(format!("status {status}: {detail}")),
        404 => ApiError::NotFound(format!("status 404: {detail}")),
        _ => ApiError::Network(format!("status {status}: {detail}")),
    }
}

/// Parse `X-Shopify-Shop-Api-Call-Limit`, e.g. `32/40`.
fn parse_call_limit(header: &str) -> Option<(u32, u32)> {
    let (used, limit) = header.trim().split_once('/')?;
    let used = used.parse().ok()?;
    let limit: u32 = limit.parse().ok()?;
    if limit == 0 {
        return None;
    }
    Some((used, limit))
}

/// Extract the `page_info` cursor from a `Link` header's `rel="next"`
/// entry.
fn next_page_info(link: &str) -> Option<String> {
    for part in link.split(',') {
        let part = part.trim();
        if !part.ends_with("rel=\"next\"") {
            continue;
        }
        let url = part.strip_prefix('<')?.split('>').next()?;
        let (_, query) = url.split_once('?')?;
        for pair in query.split('&') {
            if let Some(cursor) = pair.strip_prefix("page_info=") {
                return Some(cursor.to_string());
            }
        }
    }
    None
}

fn truncate(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
