//! The edgecache server binary.
//!
//! See [`edgecache_server::cli`] for available commands.

fn main() -> anyhow::Result<()> {
    edgecache_server::cli::execute()
}
