//! Full-payload decode + map checks against captured marketplace responses.

use trendscout_adapters::{
    map_aliexpress_item, map_shopify_product, map_tiktok_product, AliexpressPayload,
    ShopifyCatalog, TiktokPayload,
};

const ALIEXPRESS_BODY: &str = r#"{
  "items": [
    {
      "productId": 1005006112233,
      "title": "  Mini Projector 1080P Portable ",
      "salePrice": { "value": "34.99", "currency": "usd" },
      "imageUrl": "https://ae01.alicdn.com/kf/mini-projector.jpg",
      "productUrl": "https://www.aliexpress.com/item/1005006112233.html",
      "categoryName": "Electronics"
    },
    {
      "productId": "1005006445566",
      "title": "Magnetic Phone Mount",
      "salePrice": { "value": 7.45 },
      "categoryName": "Car Accessories"
    }
  ]
}"#;

const TIKTOK_BODY: &str = r#"{
  "products": [
    {
      "id": "7421003344556677",
      "name": "Cloud Slides",
      "price": { "amount": "12.99", "currency": "USD" },
      "cover_url": "https://p16-oec.tiktokcdn.com/cloud-slides.webp",
      "link": "https://shop.tiktok.com/view/product/7421003344556677",
      "category": "Fashion"
    }
  ]
}"#;

const SHOPIFY_BODY: &str = r#"{
  "products": [
    {
      "id": 8711223344,
      "title": "Ceramic Pour-Over Set",
      "handle": "ceramic-pour-over-set",
      "product_type": "Home & Kitchen",
      "variants": [ { "price": "42.00" }, { "price": "48.00" } ],
      "images": [ { "src": "https://cdn.shopify.com/pour-over.jpg" } ]
    }
  ]
}"#;

#[test]
fn aliexpress_payload_maps_ids_and_prices_of_both_shapes() {
    let payload: AliexpressPayload = serde_json::from_str(ALIEXPRESS_BODY).unwrap();
    assert_eq!(payload.items.len(), 2);

    let first = map_aliexpress_item(&payload.items[0]);
    assert_eq!(first.external_id.as_deref(), Some("1005006112233"));
    assert_eq!(first.source.as_deref(), Some("aliexpress"));
    assert_eq!(first.currency.as_deref(), Some("usd"));
    assert_eq!(first.category.as_deref(), Some("Electronics"));
    assert_eq!(
        first.price.as_ref().and_then(|v| v.as_str()),
        Some("34.99")
    );

    let second = map_aliexpress_item(&payload.items[1]);
    assert_eq!(second.external_id.as_deref(), Some("1005006445566"));
    assert_eq!(second.price.as_ref().and_then(|v| v.as_f64()), Some(7.45));
    assert_eq!(second.currency, None);
    assert_eq!(second.image_url, None);
}

#[test]
fn tiktok_payload_maps_string_amounts() {
    let payload: TiktokPayload = serde_json::from_str(TIKTOK_BODY).unwrap();
    let raw = map_tiktok_product(&payload.products[0]);
    assert_eq!(raw.external_id.as_deref(), Some("7421003344556677"));
    assert_eq!(raw.title.as_deref(), Some("Cloud Slides"));
    assert_eq!(raw.source.as_deref(), Some("tiktok"));
    assert_eq!(raw.price.as_ref().and_then(|v| v.as_str()), Some("12.99"));
    assert_eq!(raw.category.as_deref(), Some("Fashion"));
}

#[test]
fn shopify_catalog_uses_first_variant_and_first_image() {
    let catalog: ShopifyCatalog = serde_json::from_str(SHOPIFY_BODY).unwrap();
    let raw = map_shopify_product(&catalog.products[0], "https://brewgear.example.com");
    assert_eq!(raw.external_id.as_deref(), Some("8711223344"));
    assert_eq!(raw.price.as_ref().and_then(|v| v.as_str()), Some("42.00"));
    assert_eq!(
        raw.image_url.as_deref(),
        Some("https://cdn.shopify.com/pour-over.jpg")
    );
    assert_eq!(
        raw.product_url.as_deref(),
        Some("https://brewgear.example.com/products/ceramic-pour-over-set")
    );
    assert_eq!(raw.category.as_deref(), Some("Home & Kitchen"));
}

#[test]
fn unknown_shape_is_rejected_at_decode_time() {
    let err = serde_json::from_str::<TiktokPayload>(r#"{ "products": "not-a-list" }"#);
    assert!(err.is_err());
}
