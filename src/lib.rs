pub mod libs;

/// Crate version, reported in run banners and the HTML report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
