fn main() {
    if let Err(err) = treekill::cli::run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
