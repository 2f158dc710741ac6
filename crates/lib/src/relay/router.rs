//! Decide how an inbound message is handled.

use crate::channels::{ContentKind, ImageRef, InboundMessage};

/// Handling path for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Answer the query text.
    Text(String),
    /// Analyze the image.
    Image(ImageRef),
    /// Reply with the fixed notice; carries the platform message type.
    Unsupported(String),
}

/// Every message gets exactly one route. Empty text is not worth a card.
pub fn classify(message: &InboundMessage) -> Route {
    match &message.kind {
        ContentKind::Text(text) if text.trim().is_empty() => Route::Unsupported("text".to_string()),
        ContentKind::Text(text) => Route::Text(text.clone()),
        ContentKind::Image(image) => Route::Image(image.clone()),
        ContentKind::Unsupported(kind) => Route::Unsupported(kind.clone()),
    }
}
