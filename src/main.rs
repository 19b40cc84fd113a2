fn main() -> std::process::ExitCode {
    ledgerlens::run()
}
