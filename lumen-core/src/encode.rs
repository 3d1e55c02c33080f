use std::io::Cursor;

use anyhow::Result;
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;

pub const DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// Serializes an image into a PNG byte stream.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

/// Wraps an image as a base64 PNG data URI for direct client-side rendering.
pub fn to_data_uri(img: &DynamicImage) -> Result<String> {
    Ok(format!(
        "{DATA_URI_PREFIX}{}",
        BASE64_STANDARD.encode(png_bytes(img)?)
    ))
}

/// Recovers the PNG byte stream from a data URI produced by [`to_data_uri`].
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>> {
    let payload = uri
        .strip_prefix(DATA_URI_PREFIX)
        .ok_or_else(|| anyhow::anyhow!("not a PNG data URI"))?;
    Ok(BASE64_STANDARD.decode(payload)?)
}
