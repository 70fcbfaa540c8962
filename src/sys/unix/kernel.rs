//! One-shot kernel capability probes.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod version {
    use std::sync::OnceLock;

    /// Parsed `major.minor.patch` of the running kernel, zero on failure.
    fn release() -> (u32, u32, u32) {
        static RELEASE: OnceLock<(u32, u32, u32)> = OnceLock::new();
        *RELEASE.get_or_init(|| {
            let mut name: libc::utsname = unsafe { std::mem::zeroed() };
            if unsafe { libc::uname(&mut name) } != 0 {
                return (0, 0, 0);
            }

            let release = name
                .release
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8 as char)
                .collect::<String>();
            parse(&release)
        })
    }

    fn parse(release: &str) -> (u32, u32, u32) {
        let mut parts = release
            .split(|c: char| !c.is_ascii_digit())
            .map(|p| p.parse().unwrap_or(0));
        (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        )
    }

    pub(crate) fn is_at_least(major: u32, minor: u32, patch: u32) -> bool {
        release() >= (major, minor, patch)
    }

    #[cfg(test)]
    mod tests {
        use super::parse;

        #[test]
        fn parses_distribution_suffixes() {
            assert_eq!(parse("2.6.17"), (2, 6, 17));
            assert_eq!(parse("5.15.0-97-generic"), (5, 15, 0));
            assert_eq!(parse("6.1"), (6, 1, 0));
        }
    }
}

/// Whether `EPOLLRDHUP`/`POLLRDHUP` may be requested. The flags appeared in
/// kernel 2.6.17; older kernels reject them.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn can_use_rdhup() -> bool {
    version::is_at_least(2, 6, 17)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn can_use_rdhup() -> bool {
    false
}
