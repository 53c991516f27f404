//! C2 — the built-in default-allow domain list.
//!
//! Materialized once to `$WARDEN_HOME/default-firewall-rules.conf` on first
//! use (one domain suffix per line, `#` comments, blank lines ignored) so an
//! operator can edit it without touching any per-VM state. Matching is
//! exact-or-subdomain and case-insensitive.

use crate::paths;
use crate::WardenResult;

pub const BUILTIN_DEFAULT_DOMAINS: &str = "\
# Default allowed domains for the warden firewall
# Lines starting with # are comments
# Each line is a domain suffix to allow (e.g. \"github.com\" allows *.github.com)

# Ubuntu package repositories
archive.ubuntu.com
ports.ubuntu.com
security.ubuntu.com
ppa.launchpad.net
ppa.launchpadcontent.net

# Canonical services (NTP, mirrors, etc.)
canonical.com
ubuntu.com
launchpad.net

# Common package sources
debian.org
deb.nodesource.com
dl.google.com
packages.microsoft.com
download.docker.com

# Development services
github.com
githubusercontent.com
pypi.org
files.pythonhosted.org
npmjs.org
registry.npmjs.org
";

/// Create the default rules file with built-in contents if it doesn't
/// already exist, then return its path.
fn ensure_default_rules_file() -> WardenResult<std::path::PathBuf> {
    let path = paths::default_rules_path()?;
    if !path.exists() {
        std::fs::write(&path, BUILTIN_DEFAULT_DOMAINS)?;
    }
    Ok(path)
}

/// Read the default-allowed domain suffixes, lowercased, comments and blank
/// lines stripped.
pub fn read_default_domains() -> WardenResult<Vec<String>> {
    let path = ensure_default_rules_file()?;
    let text = std::fs::read_to_string(&path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_lowercase())
        .collect())
}

/// If `hostname` is covered by a default-allowed domain (exact match or
/// subdomain), return the matched suffix.
pub fn matches_default_domain(hostname: &str) -> WardenResult<Option<String>> {
    let domains = read_default_domains()?;
    let hostname_lower = hostname.to_lowercase();
    for domain in domains {
        if hostname_lower == domain || hostname_lower.ends_with(&format!(".{domain}")) {
            return Ok(Some(domain));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct HomeGuard {
        _tmp: tempfile::TempDir,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    fn isolated_home() -> HomeGuard {
        let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let tmp = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var(paths::ENV_HOME, tmp.path());
        }
        HomeGuard {
            _tmp: tmp,
            _lock: lock,
        }
    }

    #[test]
    fn exact_domain_matches() {
        let _home = isolated_home();
        assert_eq!(
            matches_default_domain("github.com").unwrap(),
            Some("github.com".to_string())
        );
    }

    #[test]
    fn subdomain_matches_by_suffix() {
        let _home = isolated_home();
        assert_eq!(
            matches_default_domain("raw.githubusercontent.com").unwrap(),
            Some("githubusercontent.com".to_string())
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let _home = isolated_home();
        assert!(matches_default_domain("GitHub.COM").unwrap().is_some());
    }

    #[test]
    fn unrelated_domain_does_not_match() {
        let _home = isolated_home();
        assert_eq!(matches_default_domain("evil.example.com").unwrap(), None);
    }

    #[test]
    fn lookalike_suffix_without_dot_boundary_does_not_match() {
        let _home = isolated_home();
        // "notgithub.com" must not match the "github.com" suffix.
        assert_eq!(matches_default_domain("notgithub.com").unwrap(), None);
    }

    #[test]
    fn custom_file_contents_are_respected() {
        let _home = isolated_home();
        let path = paths::default_rules_path().unwrap();
        std::fs::write(&path, "example.org\n").unwrap();
        assert_eq!(
            matches_default_domain("www.example.org").unwrap(),
            Some("example.org".to_string())
        );
        assert_eq!(matches_default_domain("github.com").unwrap(), None);
    }
}
