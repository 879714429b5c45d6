fn main() {
    std::process::exit(itest_harness::run());
}
