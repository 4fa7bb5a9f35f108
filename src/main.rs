fn main() -> std::process::ExitCode {
    tablegrid_lib::run()
}
