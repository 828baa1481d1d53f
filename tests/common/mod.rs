use assert_cmd::Command;

pub fn relaybot_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("relaybot").expect("relaybot test binary should build")
    }
}
