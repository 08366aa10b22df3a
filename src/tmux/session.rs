//! Session naming.

/// Session of the town-wide supervisor.
pub const MAYOR_SESSION: &str = "gt-mayor";

/// Session of the town-wide watcher.
pub const DEACON_SESSION: &str = "gt-deacon";

/// Session of a polecat or crew member: `gt-<rig>-<name>`.
pub fn rig_agent_session(rig: &str, name: &str) -> String {
    format!("gt-{}-{}", rig, name)
}

pub fn witness_session(rig: &str) -> String {
    rig_agent_session(rig, "witness")
}

pub fn refinery_session(rig: &str) -> String {
    rig_agent_session(rig, "refinery")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_names() {
        assert_eq!(rig_agent_session("acme", "fox"), "gt-acme-fox");
        assert_eq!(witness_session("acme"), "gt-acme-witness");
        assert_eq!(refinery_session("acme"), "gt-acme-refinery");
    }
}
