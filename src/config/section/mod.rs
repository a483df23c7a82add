//! Configuration sections of `kiln.toml`.

mod build;
mod cache;
mod registry;
mod scan;
mod serve;
mod watch;

pub use build::BuildSection;
pub use cache::CacheSection;
pub use registry::RegistrySection;
pub use scan::ScanSection;
pub use serve::ServeSection;
pub use watch::WatchSection;

/// Worker count default: available parallelism capped at 8.
pub(crate) fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 8)
}
