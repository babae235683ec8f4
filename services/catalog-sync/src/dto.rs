// =============================================================================
// CATALOG PAYLOAD MODULE
// =============================================================================
// Turns the FacilZap product listing into [`RemotePage`].
//
// The upstream schema is inconsistent: the same value shows up under English
// or Portuguese keys (sometimes both in one record), ids come as numbers or
// strings, and prices come as numbers, dotted strings or "R$ 1.234,56".
// Records are read as JSON objects and each value is taken from the first
// non-null key in its alias list, so the reconciler only ever sees
// RemoteProduct.
//
// A record that can't become a product is skipped and counted in
// `RemotePage::skipped`; the caller decides whether that page is usable.
// =============================================================================

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Value};

use crate::error::CatalogSourceError;
use crate::models::{RemotePage, RemoteProduct, RemoteVariant};

type Record = Map<String, Value>;

// Alias lists, in priority order
const LIST_KEYS: &[&str] = &["data", "products", "produtos"];
const TOTAL_PAGES_KEYS: &[&str] = &["total_pages", "totalPages", "last_page", "total_paginas"];

const ID_KEYS: &[&str] = &["id", "codigo", "external_id"];
const NAME_KEYS: &[&str] = &["name", "nome"];
const PRICE_KEYS: &[&str] = &["price", "preco", "valor"];
const VARIANT_KEYS: &[&str] = &["variants", "variacoes"];
const IMAGE_KEYS: &[&str] = &["images", "imagens", "fotos"];
const BARCODE_KEYS: &[&str] = &["barcode", "codigo_barras", "ean"];
const STOCK_KEYS: &[&str] = &["stock", "estoque"];

const COLOR_KEYS: &[&str] = &["color", "cor"];
const SIZE_KEYS: &[&str] = &["size", "tamanho"];
const IMAGE_URL_KEYS: &[&str] = &["url", "src", "link"];

/// Decode one listing response body.
///
/// Fails only when the envelope itself is unusable; bad records are counted.
pub(crate) fn decode_page(body: &[u8]) -> Result<RemotePage, CatalogSourceError> {
    let envelope: Value =
        serde_json::from_slice(body).map_err(|e| CatalogSourceError::Decode(e.to_string()))?;
    let Value::Object(envelope) = envelope else {
        return Err(CatalogSourceError::Decode(
            "listing body is not a JSON object".to_string(),
        ));
    };

    let records: &[Value] = match first_of(&envelope, LIST_KEYS) {
        None => &[],
        Some(Value::Array(records)) => records,
        Some(_) => {
            return Err(CatalogSourceError::Decode(
                "product list is not an array".to_string(),
            ))
        }
    };

    let mut products = Vec::with_capacity(records.len());
    let mut skipped = 0;
    for record in records {
        match record.as_object().and_then(product_of) {
            Some(product) => products.push(product),
            None => {
                skipped += 1;
                tracing::warn!(
                    record = %truncate(record),
                    "Skipping undecodable catalog record"
                );
            }
        }
    }

    Ok(RemotePage {
        products,
        total_pages: first_of(&envelope, TOTAL_PAGES_KEYS)
            .and_then(integer_of)
            .and_then(|n| u32::try_from(n).ok()),
        skipped,
    })
}

/// `None` when the record has no usable id
fn product_of(record: &Record) -> Option<RemoteProduct> {
    let external_id = first_of(record, ID_KEYS).and_then(text_of)?;

    let variants: Vec<RemoteVariant> = first_of(record, VARIANT_KEYS)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(variant_of)
                .collect()
        })
        .unwrap_or_default();

    // Some listings only price the variants
    let base_price = first_of(record, PRICE_KEYS)
        .and_then(decimal_of)
        .or_else(|| variants.iter().filter_map(|v| v.price).min())
        .unwrap_or(Decimal::ZERO);

    let images = first_of(record, IMAGE_KEYS)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(image_url).collect())
        .unwrap_or_default();

    Some(RemoteProduct {
        external_id,
        name: first_of(record, NAME_KEYS)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        base_price,
        variants,
        images,
        barcode: first_of(record, BARCODE_KEYS).and_then(text_of),
        stock: first_of(record, STOCK_KEYS).and_then(integer_of).map(clamp_stock),
    })
}

fn variant_of(record: &Record) -> RemoteVariant {
    let label = |keys: &[&str]| {
        first_of(record, keys)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    RemoteVariant {
        color: label(COLOR_KEYS),
        size: label(SIZE_KEYS),
        stock: first_of(record, STOCK_KEYS)
            .and_then(integer_of)
            .map(clamp_stock)
            .unwrap_or(0),
        price: first_of(record, PRICE_KEYS).and_then(decimal_of),
    }
}

/// Images come as bare URLs or as `{ url | src | link }` objects
fn image_url(value: &Value) -> Option<String> {
    let url = match value {
        Value::String(url) => url.as_str(),
        Value::Object(object) => first_of(object, IMAGE_URL_KEYS).and_then(Value::as_str)?,
        _ => return None,
    };
    let url = url.trim();
    (!url.is_empty()).then(|| url.to_string())
}

/// First non-null value among `keys`
fn first_of<'a>(record: &'a Record, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find(|value| !value.is_null())
}

fn clamp_stock(raw: i64) -> i32 {
    i32::try_from(raw.max(0)).unwrap_or(i32::MAX)
}

/// Ids and barcodes: strings as-is, numbers rendered without decoration
fn text_of(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn decimal_of(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let raw = n.to_string();
            Decimal::from_str(&raw)
                .or_else(|_| Decimal::from_scientific(&raw))
                .ok()
        }
        Value::String(s) => parse_price_text(s),
        _ => None,
    }
}

/// Accepts `"12.90"`, `"12,90"`, `"R$ 1.234,56"`
fn parse_price_text(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };

    Decimal::from_str(&normalized).ok()
}

fn truncate(record: &Value) -> String {
    record.to_string().chars().take(200).collect()
}
