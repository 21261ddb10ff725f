use std::process::ExitCode;

fn main() -> ExitCode {
    story_cast_lib::run()
}
