fn main() {
    let args = std::env::args();
    // Initialize logging as early as possible; fallback to stderr on failure.
    let _ = compatfs::logging::init_logging(compatfs::logging::LogFormat::Human);

    if let Err(err) = compatfs::run(args) {
        eprintln!("compatfs error: {err}");
        std::process::exit(1);
    }
}
