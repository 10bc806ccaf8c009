fn main() {
    if let Err(err) = estafette::cli::main() {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}
