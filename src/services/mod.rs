pub mod bucket_cache;
pub mod children;
pub mod content_stream;
pub mod lister;
pub mod navigation;
pub mod object_index;
