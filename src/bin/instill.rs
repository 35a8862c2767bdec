fn main() {
    std::process::exit(instill::cli::main());
}
