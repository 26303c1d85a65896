// Media classification: file kind and MIME reconciliation.

pub mod media;

pub use media::{classify_media, guess_mime_by_name, reconcile_mime, sniff_mime, MediaKind};
