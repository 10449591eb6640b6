//! Default capability allowlist for a stage's bounding set, unioned with
//! whatever a stage module declares as its own extra capabilities.

use caps::Capability;

const DEFAULT_ALLOWED: &[Capability] = &[
    Capability::CAP_CHOWN,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_DAC_READ_SEARCH,
    Capability::CAP_FOWNER,
    Capability::CAP_FSETID,
    Capability::CAP_IPC_LOCK,
    Capability::CAP_LINUX_IMMUTABLE,
    Capability::CAP_MAC_OVERRIDE,
    Capability::CAP_MKNOD,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_SETFCAP,
    Capability::CAP_SETGID,
    Capability::CAP_SETPCAP,
    Capability::CAP_SETUID,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_SYS_NICE,
    Capability::CAP_SYS_RESOURCE,
    Capability::CAP_AUDIT_WRITE,
    Capability::CAP_MAC_ADMIN,
];

/// The fixed allowlist unioned with any stage-declared extras, deduplicated.
pub fn default_allowed_capabilities(extra: &[Capability]) -> Vec<Capability> {
    let mut set: Vec<Capability> = DEFAULT_ALLOWED.to_vec();
    for cap in extra {
        if !set.contains(cap) {
            set.push(*cap);
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_deduplicates() {
        let caps = default_allowed_capabilities(&[Capability::CAP_CHOWN, Capability::CAP_NET_RAW]);
        let chown_count = caps.iter().filter(|c| **c == Capability::CAP_CHOWN).count();
        assert_eq!(chown_count, 1);
        assert!(caps.contains(&Capability::CAP_NET_RAW));
    }
}
