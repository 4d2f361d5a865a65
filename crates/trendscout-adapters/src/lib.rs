//! Marketplace source adapters.
//!
//! Each adapter owns one external marketplace: it fetches that platform's
//! listing payload and maps it into loosely-typed [`RawListing`] candidates
//! through an explicit per-source struct plus a pure mapping function.
//! Unknown payload shapes are rejected here, at the boundary; field-level
//! validation belongs to the engine's normalizer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use trendscout_core::{RawListing, SourcePlatform};
use trendscout_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "trendscout-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("decoding {platform} payload: {detail}")]
    Payload {
        platform: SourcePlatform,
        detail: String,
    },
}

/// One registered marketplace. A failing `fetch` surfaces as a single
/// source-level error in the orchestrator; it never aborts other sources.
/// No ordering guarantee is made on the returned listings.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> SourcePlatform;

    async fn fetch(&self) -> Result<Vec<RawListing>, AdapterError>;
}

fn payload_error(platform: SourcePlatform, err: serde_json::Error) -> AdapterError {
    AdapterError::Payload {
        platform,
        detail: err.to_string(),
    }
}

/// Ids arrive as JSON strings or numbers depending on the marketplace.
fn id_string(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// AliExpress

#[derive(Debug, Clone, Deserialize)]
pub struct AliexpressPayload {
    #[serde(default)]
    pub items: Vec<AliexpressItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliexpressItem {
    #[serde(rename = "productId")]
    pub product_id: Option<JsonValue>,
    pub title: Option<String>,
    #[serde(rename = "salePrice")]
    pub sale_price: Option<AliexpressPrice>,
    #[serde(rename = "imageUrl")]
    pub image_url: Option<String>,
    #[serde(rename = "productUrl")]
    pub product_url: Option<String>,
    #[serde(rename = "categoryName")]
    pub category_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliexpressPrice {
    pub value: Option<JsonValue>,
    pub currency: Option<String>,
}

pub fn map_aliexpress_item(item: &AliexpressItem) -> RawListing {
    RawListing {
        external_id: id_string(item.product_id.as_ref()),
        title: item.title.clone(),
        source: Some(SourcePlatform::Aliexpress.as_str().to_string()),
        price: item.sale_price.as_ref().and_then(|p| p.value.clone()),
        currency: item.sale_price.as_ref().and_then(|p| p.currency.clone()),
        image_url: item.image_url.clone(),
        product_url: item.product_url.clone(),
        category: item.category_name.clone(),
    }
}

// ---------------------------------------------------------------------------
// TikTok Shop

#[derive(Debug, Clone, Deserialize)]
pub struct TiktokPayload {
    #[serde(default)]
    pub products: Vec<TiktokProduct>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TiktokProduct {
    pub id: Option<JsonValue>,
    pub name: Option<String>,
    pub price: Option<TiktokPrice>,
    pub cover_url: Option<String>,
    pub link: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TiktokPrice {
    pub amount: Option<String>,
    pub currency: Option<String>,
}

pub fn map_tiktok_product(product: &TiktokProduct) -> RawListing {
    RawListing {
        external_id: id_string(product.id.as_ref()),
        title: product.name.clone(),
        source: Some(SourcePlatform::Tiktok.as_str().to_string()),
        price: product
            .price
            .as_ref()
            .and_then(|p| p.amount.clone())
            .map(JsonValue::String),
        currency: product.price.as_ref().and_then(|p| p.currency.clone()),
        image_url: product.cover_url.clone(),
        product_url: product.link.clone(),
        category: product.category.clone(),
    }
}

// ---------------------------------------------------------------------------
// Temu

#[derive(Debug, Clone, Deserialize)]
pub struct TemuPayload {
    #[serde(default)]
    pub goods_list: Vec<TemuGoods>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemuGoods {
    pub goods_id: Option<JsonValue>,
    pub goods_name: Option<String>,
    pub price_info: Option<TemuPrice>,
    pub thumb_url: Option<String>,
    pub goods_url: Option<String>,
    pub category_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemuPrice {
    /// Minor units (cents); Temu never sends fractional prices.
    pub price: Option<i64>,
    pub currency: Option<String>,
}

pub fn map_temu_goods(goods: &TemuGoods) -> RawListing {
    let price = goods
        .price_info
        .as_ref()
        .and_then(|p| p.price)
        .and_then(|cents| serde_json::Number::from_f64(cents as f64 / 100.0))
        .map(JsonValue::Number);
    RawListing {
        external_id: id_string(goods.goods_id.as_ref()),
        title: goods.goods_name.clone(),
        source: Some(SourcePlatform::Temu.as_str().to_string()),
        price,
        currency: goods.price_info.as_ref().and_then(|p| p.currency.clone()),
        image_url: goods.thumb_url.clone(),
        product_url: goods.goods_url.clone(),
        category: goods.category_name.clone(),
    }
}

// ---------------------------------------------------------------------------
// Shopify (storefront /products.json)

#[derive(Debug, Clone, Deserialize)]
pub struct ShopifyCatalog {
    #[serde(default)]
    pub products: Vec<ShopifyProduct>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShopifyProduct {
    pub id: Option<JsonValue>,
    pub title: Option<String>,
    pub handle: Option<String>,
    pub product_type: Option<String>,
    #[serde(default)]
    pub variants: Vec<ShopifyVariant>,
    #[serde(default)]
    pub images: Vec<ShopifyImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShopifyVariant {
    pub price: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShopifyImage {
    pub src: Option<String>,
}

pub fn map_shopify_product(product: &ShopifyProduct, store_url: &str) -> RawListing {
    let product_url = product
        .handle
        .as_deref()
        .map(|handle| format!("{}/products/{handle}", store_url.trim_end_matches('/')));
    RawListing {
        external_id: id_string(product.id.as_ref()),
        title: product.title.clone(),
        source: Some(SourcePlatform::Shopify.as_str().to_string()),
        price: product
            .variants
            .first()
            .and_then(|v| v.price.clone())
            .map(JsonValue::String),
        currency: None,
        image_url: product.images.first().and_then(|i| i.src.clone()),
        product_url,
        category: product.product_type.clone(),
    }
}

// ---------------------------------------------------------------------------
// Live adapters

pub struct AliexpressAdapter {
    fetcher: Arc<HttpFetcher>,
    endpoint: String,
}

impl AliexpressAdapter {
    pub fn new(fetcher: Arc<HttpFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for AliexpressAdapter {
    fn platform(&self) -> SourcePlatform {
        SourcePlatform::Aliexpress
    }

    async fn fetch(&self) -> Result<Vec<RawListing>, AdapterError> {
        let body = self
            .fetcher
            .fetch_bytes(self.platform().as_str(), &self.endpoint)
            .await?;
        let payload: AliexpressPayload =
            serde_json::from_slice(&body).map_err(|e| payload_error(self.platform(), e))?;
        Ok(payload.items.iter().map(map_aliexpress_item).collect())
    }
}

pub struct TiktokShopAdapter {
    fetcher: Arc<HttpFetcher>,
    endpoint: String,
}

impl TiktokShopAdapter {
    pub fn new(fetcher: Arc<HttpFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for TiktokShopAdapter {
    fn platform(&self) -> SourcePlatform {
        SourcePlatform::Tiktok
    }

    async fn fetch(&self) -> Result<Vec<RawListing>, AdapterError> {
        let body = self
            .fetcher
            .fetch_bytes(self.platform().as_str(), &self.endpoint)
            .await?;
        let payload: TiktokPayload =
            serde_json::from_slice(&body).map_err(|e| payload_error(self.platform(), e))?;
        Ok(payload.products.iter().map(map_tiktok_product).collect())
    }
}

pub struct TemuAdapter {
    fetcher: Arc<HttpFetcher>,
    endpoint: String,
}

impl TemuAdapter {
    pub fn new(fetcher: Arc<HttpFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for TemuAdapter {
    fn platform(&self) -> SourcePlatform {
        SourcePlatform::Temu
    }

    async fn fetch(&self) -> Result<Vec<RawListing>, AdapterError> {
        let body = self
            .fetcher
            .fetch_bytes(self.platform().as_str(), &self.endpoint)
            .await?;
        let payload: TemuPayload =
            serde_json::from_slice(&body).map_err(|e| payload_error(self.platform(), e))?;
        Ok(payload.goods_list.iter().map(map_temu_goods).collect())
    }
}

pub struct ShopifyAdapter {
    fetcher: Arc<HttpFetcher>,
    store_url: String,
}

impl ShopifyAdapter {
    pub fn new(fetcher: Arc<HttpFetcher>, store_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            store_url: store_url.into(),
        }
    }

    fn catalog_url(&self) -> String {
        format!("{}/products.json", self.store_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SourceAdapter for ShopifyAdapter {
    fn platform(&self) -> SourcePlatform {
        SourcePlatform::Shopify
    }

    async fn fetch(&self) -> Result<Vec<RawListing>, AdapterError> {
        let body = self
            .fetcher
            .fetch_bytes(self.platform().as_str(), &self.catalog_url())
            .await?;
        let catalog: ShopifyCatalog =
            serde_json::from_slice(&body).map_err(|e| payload_error(self.platform(), e))?;
        Ok(catalog
            .products
            .iter()
            .map(|p| map_shopify_product(p, &self.store_url))
            .collect())
    }
}

/// Adapter serving a fixed listing set. Used by tests and for plugin-style
/// registration of feeds that arrive out of band.
pub struct StaticAdapter {
    platform: SourcePlatform,
    listings: Vec<RawListing>,
}

impl StaticAdapter {
    pub fn new(platform: SourcePlatform, listings: Vec<RawListing>) -> Self {
        Self { platform, listings }
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn platform(&self) -> SourcePlatform {
        self.platform
    }

    async fn fetch(&self) -> Result<Vec<RawListing>, AdapterError> {
        Ok(self.listings.clone())
    }
}

/// Build the live adapter for a platform. `Onchain` has no feed yet and
/// resolves to an empty static adapter so a registry entry for it is inert.
pub fn adapter_for_source(
    platform: SourcePlatform,
    fetcher: Arc<HttpFetcher>,
    endpoint: impl Into<String>,
) -> Arc<dyn SourceAdapter> {
    let endpoint = endpoint.into();
    match platform {
        SourcePlatform::Aliexpress => Arc::new(AliexpressAdapter::new(fetcher, endpoint)),
        SourcePlatform::Tiktok => Arc::new(TiktokShopAdapter::new(fetcher, endpoint)),
        SourcePlatform::Temu => Arc::new(TemuAdapter::new(fetcher, endpoint)),
        SourcePlatform::Shopify => Arc::new(ShopifyAdapter::new(fetcher, endpoint)),
        SourcePlatform::Onchain => Arc::new(StaticAdapter::new(platform, Vec::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_string_accepts_strings_and_numbers() {
        assert_eq!(id_string(Some(&json!("abc-1"))), Some("abc-1".to_string()));
        assert_eq!(id_string(Some(&json!(42))), Some("42".to_string()));
        assert_eq!(id_string(Some(&json!(["nope"]))), None);
        assert_eq!(id_string(None), None);
    }

    #[test]
    fn temu_prices_convert_from_minor_units() {
        let goods = TemuGoods {
            goods_id: Some(json!(601099512345_i64)),
            goods_name: Some("LED Strip".to_string()),
            price_info: Some(TemuPrice {
                price: Some(1299),
                currency: Some("usd".to_string()),
            }),
            thumb_url: None,
            goods_url: None,
            category_name: Some("Electronics".to_string()),
        };
        let raw = map_temu_goods(&goods);
        assert_eq!(raw.source.as_deref(), Some("temu"));
        assert_eq!(raw.price.and_then(|v| v.as_f64()), Some(12.99));
    }

    #[test]
    fn shopify_product_url_derives_from_handle() {
        let product = ShopifyProduct {
            id: Some(json!(991)),
            title: Some("Ceramic Mug".to_string()),
            handle: Some("ceramic-mug".to_string()),
            product_type: Some("Home & Kitchen".to_string()),
            variants: vec![ShopifyVariant {
                price: Some("18.50".to_string()),
            }],
            images: vec![],
        };
        let raw = map_shopify_product(&product, "https://shop.example.com/");
        assert_eq!(
            raw.product_url.as_deref(),
            Some("https://shop.example.com/products/ceramic-mug")
        );
        assert_eq!(raw.price, Some(json!("18.50")));
    }

    #[tokio::test]
    async fn static_adapter_replays_listings() {
        let listing = RawListing {
            external_id: Some("x-1".to_string()),
            title: Some("Thing".to_string()),
            source: Some("tiktok".to_string()),
            price: Some(json!(3.5)),
            ..RawListing::default()
        };
        let adapter = StaticAdapter::new(SourcePlatform::Tiktok, vec![listing.clone()]);
        assert_eq!(adapter.platform(), SourcePlatform::Tiktok);
        assert_eq!(adapter.fetch().await.unwrap(), vec![listing]);
    }
}
