// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

fn main() {
    std::process::exit(imager_lib::cli::run_from_iter(std::env::args()));
}
