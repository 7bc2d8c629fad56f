//! Kernel argument filtering.
//!
//! The ISO bootloader reuses the kernel command line recovered from the
//! disk image, minus arguments that are boot-time-irrelevant or actively
//! wrong on optical/USB media (the disk image's root device, its console
//! wiring, its first-boot markers). Deterministic: same input, same
//! output, order preserved.

/// Argument keys stripped from the disk image's command line.
///
/// The key of a token is the substring before the first `=`.
const EXCLUDED_KARG_KEYS: &[&str] = &[
    "ignition.firstboot",
    "console",
    "ignition.platform.id",
    "ostree",
    "root",
    "rootflags",
    "rw",
];

/// Filter a full kernel command line down to the tokens the ISO
/// bootloader should carry.
pub fn filter_kargs(cmdline: &str) -> String {
    cmdline
        .split_whitespace()
        .filter(|token| {
            let key = token.split('=').next().unwrap_or(token);
            !EXCLUDED_KARG_KEYS.contains(&key)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excluded_keys_are_removed() {
        let input = "mitigations=auto,nosmt console=ttyS0,115200n8 \
                     ignition.platform.id=metal ostree=/ostree/boot.1/os/x/0 \
                     root=UUID=abcd rootflags=prjquota rw ignition.firstboot";
        assert_eq!(filter_kargs(input), "mitigations=auto,nosmt");
    }

    #[test]
    fn surviving_tokens_keep_relative_order() {
        let input = "b=2 console=tty0 a=1 rw z";
        assert_eq!(filter_kargs(input), "b=2 a=1 z");
    }

    #[test]
    fn key_match_is_exact_not_prefix() {
        // "rootfstype" shares a prefix with excluded "root" but is a
        // different key and must survive.
        assert_eq!(
            filter_kargs("rootfstype=xfs root=/dev/sda1"),
            "rootfstype=xfs"
        );
    }

    #[test]
    fn bare_excluded_key_is_removed() {
        assert_eq!(filter_kargs("rw quiet"), "quiet");
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert_eq!(filter_kargs(""), "");
        assert_eq!(filter_kargs("   "), "");
    }
}
