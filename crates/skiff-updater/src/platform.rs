//! Target platform and architecture naming as used by release feeds.

use std::fmt;
use std::process::Command;

use semver::Version;
use tracing::warn;

/// Operating system family an update is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    MacOs,
    Windows,
    Linux,
}

impl Platform {
    /// Platform this binary was compiled for.
    pub fn current() -> Self {
        #[cfg(target_os = "macos")]
        {
            Platform::MacOs
        }
        #[cfg(target_os = "windows")]
        {
            Platform::Windows
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            Platform::Linux
        }
    }

    /// Artifact extension expected on this platform, if it self-updates.
    pub fn artifact_extension(&self) -> Option<&'static str> {
        match self {
            Platform::MacOs => Some(".zip"),
            Platform::Windows => Some(".exe"),
            Platform::Linux => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::MacOs => write!(f, "darwin"),
            Platform::Windows => write!(f, "win32"),
            Platform::Linux => write!(f, "linux"),
        }
    }
}

/// Architecture name in the form release artifacts are labelled with.
pub fn current_arch() -> &'static str {
    feed_arch(std::env::consts::ARCH)
}

/// Map a Rust target architecture onto the release naming scheme.
pub fn feed_arch(rust_arch: &str) -> &str {
    match rust_arch {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    }
}

/// Kernel release of the running OS (`uname -r`, or the build reported by
/// `ver` on Windows), as release feeds compare it against `minOSVersion`.
pub fn current_os_release() -> Option<Version> {
    let output = if cfg!(target_os = "windows") {
        Command::new("cmd").args(["/C", "ver"]).output()
    } else {
        Command::new("uname").arg("-r").output()
    };

    match output {
        Ok(output) if output.status.success() => {
            parse_os_release(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            warn!(status = %output.status, "platform: cannot determine OS release");
            None
        }
        Err(e) => {
            warn!("platform: cannot determine OS release: {}", e);
            None
        }
    }
}

/// Leniently read the first dotted number out of `raw`, keeping at most
/// three components and dropping vendor suffixes: `"6.5.0-14-generic"` is
/// 6.5.0, `"Microsoft Windows [Version 10.0.19045.3570]"` is 10.0.19045,
/// `"13.4"` is 13.4.0.
pub fn parse_os_release(raw: &str) -> Option<Version> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let dotted: String = raw[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mut parts = dotted
        .split('.')
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_arch_mapping() {
        assert_eq!(feed_arch("x86_64"), "x64");
        assert_eq!(feed_arch("aarch64"), "arm64");
        assert_eq!(feed_arch("x86"), "ia32");
        assert_eq!(feed_arch("riscv64"), "riscv64");
    }

    #[test]
    fn test_artifact_extensions() {
        assert_eq!(Platform::MacOs.artifact_extension(), Some(".zip"));
        assert_eq!(Platform::Windows.artifact_extension(), Some(".exe"));
        assert_eq!(Platform::Linux.artifact_extension(), None);
    }

    #[test]
    fn test_current_platform() {
        let platform = Platform::current();

        #[cfg(target_os = "macos")]
        assert_eq!(platform, Platform::MacOs);
        #[cfg(target_os = "windows")]
        assert_eq!(platform, Platform::Windows);
        #[cfg(target_os = "linux")]
        assert_eq!(platform, Platform::Linux);
    }

    #[test]
    fn test_parse_os_release() {
        assert_eq!(parse_os_release("23.1.0\n"), Some(Version::new(23, 1, 0)));
        assert_eq!(
            parse_os_release("6.5.0-14-generic"),
            Some(Version::new(6, 5, 0))
        );
        assert_eq!(
            parse_os_release("\r\nMicrosoft Windows [Version 10.0.19045.3570]\r\n"),
            Some(Version::new(10, 0, 19045))
        );
        assert_eq!(parse_os_release("13.4"), Some(Version::new(13, 4, 0)));
        assert_eq!(parse_os_release("unknown"), None);
    }
}
