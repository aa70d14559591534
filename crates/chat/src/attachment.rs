use snafu::{Snafu, ensure};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use mica_llm::RequestPart;

use crate::thread::ImageRef;

/// Hard cap on attached image payloads.
pub const MAX_IMAGE_SIZE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AttachmentError {
    #[snafu(display("only image files can be attached (got '{mime_type}')"))]
    NotAnImage { mime_type: String },
    #[snafu(display("image is too large ({size} bytes, limit {limit} bytes)"))]
    TooLarge { size: usize, limit: usize },
    #[snafu(display("image payload is empty"))]
    EmptyPayload,
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;

/// Validates an attachment candidate before it enters the draft surface.
pub fn validate_image(mime_type: &str, size: usize) -> AttachmentResult<()> {
    ensure!(
        mime_type.starts_with("image/"),
        NotAnImageSnafu {
            mime_type: mime_type.to_string(),
        }
    );
    ensure!(size > 0, EmptyPayloadSnafu);
    ensure!(
        size <= MAX_IMAGE_SIZE_BYTES,
        TooLargeSnafu {
            size,
            limit: MAX_IMAGE_SIZE_BYTES,
        }
    );
    Ok(())
}

/// Transport encoding for one attached image. Revalidates so a reference that
/// bypassed the attach surface still cannot reach the wire.
pub fn encode_image(image: &ImageRef) -> AttachmentResult<RequestPart> {
    validate_image(&image.mime_type, image.bytes.len())?;
    Ok(RequestPart::InlineImage {
        mime_type: image.mime_type.clone(),
        data: BASE64.encode(&image.bytes),
    })
}
