pub mod allowlist;
pub mod cache;
pub mod fetch;
pub mod guard;
pub mod pipeline;
pub mod registry;
pub mod rewrite;
pub mod rewrite_css;
pub mod rewrite_html;

pub use allowlist::AllowlistStore;
pub use cache::FileCache;
pub use fetch::ReqwestFetcher;
pub use pipeline::{MirrorService, PipelineConfig};
pub use registry::Registry;
