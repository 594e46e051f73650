//! Scanner reachability check, run as a shell command on the fetching host.

use crate::executor::CommandSpec;
use std::time::Duration;

/// Stdout key carrying the resolved address.
pub const RESOLVED_ADDR_KEY: &str = "RESOLVED_ADDR";

/// Bound on the port check itself.
pub const CONNECT_WAIT: Duration = Duration::from_secs(3);

// Positional parameters: $1 host, $2 port, $3 wait seconds. mDNS names fall
// back to avahi when the system resolver does not know them.
const REACH_SCRIPT: &str = r#"addr=$(getent ahostsv4 "$1" 2>/dev/null | awk 'NR == 1 { print $1 }')
[ -n "$addr" ] || addr=$(avahi-resolve -4 -n "$1" 2>/dev/null | awk '{ print $2 }')
[ -n "$addr" ] || { echo "cannot resolve $1" >&2; exit 2; }
nc -z -w "$3" "$addr" "$2" 2>/dev/null || { echo "port $2 closed on $addr" >&2; exit 3; }
echo "RESOLVED_ADDR=$addr""#;

/// Builds the command that resolves `host` and checks `port` on it.
#[must_use]
pub fn reachability_command(host: &str, port: u16, wait: Duration) -> CommandSpec {
    CommandSpec::new(
        "sh",
        [
            "-c".to_string(),
            REACH_SCRIPT.to_string(),
            "reach".to_string(),
            host.to_string(),
            port.to_string(),
            wait.as_secs().max(1).to_string(),
        ],
    )
}
