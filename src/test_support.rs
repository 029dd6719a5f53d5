//! A POSIX `sh` loop that behaves enough like groovysh for the driver and session tests.

use crate::config::LaunchCommand;

pub(crate) const STAND_IN_PROMPT: &str = "groovy:";

pub(crate) const STAND_IN_SCRIPT: &str = r#"trap 'printf "Interrupted\n"' INT
while :; do
  printf 'groovy:000> '
  IFS= read -r line || exit 0
  case "$line" in
    crash) printf 'fatal: repl crashed\n'; exit 3 ;;
    nap) sleep 30 ;;
    warn) printf "NetCDF-4 C library not present; using fallback\n" >&2 ;;
    plot) printf 'image/png;base64,iVBORw0KGgo=\n' ;;
    badplot) printf 'image/png;base64,@@not-base64@@\n' ;;
    nothing) printf '===> null\n' ;;
    '') ;;
    *) printf '===> %s\n' "$line" ;;
  esac
done
"#;

pub(crate) fn stand_in_launch() -> LaunchCommand {
    LaunchCommand::new("sh", vec!["-c".to_string(), STAND_IN_SCRIPT.to_string()])
}
