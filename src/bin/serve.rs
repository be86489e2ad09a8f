//! serve - run a shell command for every accepted connection
//!
//! See `served::cli` for options.

fn main() -> anyhow::Result<()> {
    served::cli::run()
}
