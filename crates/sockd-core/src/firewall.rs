/// Rule-based firewall for proxy requests.
///
/// `socks.conf` grammar, one rule per line:
///
/// ```text
/// # comment
/// permit c 140.113.*.*
/// permit b *.*.*.*
/// ```
///
/// `c` permits CONNECT, `b` permits BIND; each octet is a literal 0-255 or
/// `*`. Evaluation is first match in file order with default deny. Any parse
/// or read error is surfaced so the session layer can fail closed.

use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

use crate::wire::Command;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed rule at line {line}: {text:?}")]
    Malformed { line: usize, text: String },
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OctetPattern {
    Any,
    Literal(u8),
}

impl OctetPattern {
    fn matches(self, octet: u8) -> bool {
        match self {
            OctetPattern::Any => true,
            OctetPattern::Literal(value) => value == octet,
        }
    }
}

/// Four per-position octet patterns, e.g. `140.113.*.*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPattern([OctetPattern; 4]);

impl IpPattern {
    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        self.0
            .iter()
            .zip(ip.octets())
            .all(|(pattern, octet)| pattern.matches(octet))
    }
}

impl std::str::FromStr for IpPattern {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return Err(());
        }
        let mut octets = [OctetPattern::Any; 4];
        for (slot, part) in octets.iter_mut().zip(parts) {
            *slot = match part {
                "*" => OctetPattern::Any,
                text => {
                    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(());
                    }
                    OctetPattern::Literal(text.parse().map_err(|_| ())?)
                }
            };
        }
        Ok(IpPattern(octets))
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub command: Command,
    pub pattern: IpPattern,
}

fn parse_rule(line: &str) -> Option<Rule> {
    let mut fields = line.split_whitespace();
    let action = fields.next()?;
    let command = fields.next()?;
    let pattern = fields.next()?;
    if fields.next().is_some() || action != "permit" {
        return None;
    }
    let command = match command {
        "c" => Command::Connect,
        "b" => Command::Bind,
        _ => return None,
    };
    Some(Rule {
        command,
        pattern: pattern.parse().ok()?,
    })
}

// ---------------------------------------------------------------------------
// Firewall
// ---------------------------------------------------------------------------

/// Ordered permit list parsed from `socks.conf`.
#[derive(Debug, Default)]
pub struct Firewall {
    rules: Vec<Rule>,
}

impl Firewall {
    /// Read and parse the rule file. The session layer treats any error as
    /// deny; the file is read again for the next session.
    pub async fn load(path: &Path) -> Result<Self, FirewallError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| FirewallError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, FirewallError> {
        let mut rules = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let rule = parse_rule(line).ok_or_else(|| FirewallError::Malformed {
                line: idx + 1,
                text: raw.to_string(),
            })?;
            rules.push(rule);
        }
        Ok(Firewall { rules })
    }

    /// The first rule in file order whose command and all four octet
    /// positions match grants the request; everything else is denied.
    pub fn permits(&self, command: Command, ip: Ipv4Addr) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.command == command && rule.pattern.matches(ip))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    #[test]
    fn test_parse_with_comments_and_blanks() {
        let fw = Firewall::parse("# header\n\npermit c 140.113.*.*\n  \npermit b *.*.*.*\n").unwrap();
        assert_eq!(fw.rules().len(), 2);
        assert_eq!(fw.rules()[0].command, Command::Connect);
        assert_eq!(fw.rules()[1].command, Command::Bind);
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let fw = Firewall::parse("permit c *.*.*.*\n").unwrap();
        assert!(fw.permits(Command::Connect, ip(8, 8, 8, 8)));
        assert!(fw.permits(Command::Connect, ip(0, 0, 0, 0)));
        assert!(fw.permits(Command::Connect, ip(255, 255, 255, 255)));
        // Command still has to match.
        assert!(!fw.permits(Command::Bind, ip(8, 8, 8, 8)));
    }

    #[test]
    fn test_exact_pattern() {
        let fw = Firewall::parse("permit c 255.255.255.255\n").unwrap();
        assert!(fw.permits(Command::Connect, ip(255, 255, 255, 255)));
        assert!(!fw.permits(Command::Connect, ip(255, 255, 255, 254)));
    }

    #[test]
    fn test_partial_wildcard() {
        let fw = Firewall::parse("permit c 140.113.*.*\n").unwrap();
        assert!(fw.permits(Command::Connect, ip(140, 113, 0, 1)));
        assert!(fw.permits(Command::Connect, ip(140, 113, 255, 255)));
        assert!(!fw.permits(Command::Connect, ip(140, 114, 0, 1)));
        assert!(!fw.permits(Command::Connect, ip(8, 8, 8, 8)));
    }

    #[test]
    fn test_default_deny() {
        let fw = Firewall::parse("").unwrap();
        assert!(!fw.permits(Command::Connect, ip(127, 0, 0, 1)));
        assert!(!fw.permits(Command::Bind, ip(127, 0, 0, 1)));

        let fw = Firewall::parse("permit c 10.*.*.*\n").unwrap();
        assert!(!fw.permits(Command::Connect, ip(8, 8, 8, 8)));
    }

    #[test]
    fn test_rule_order_is_immaterial_for_permit_lists() {
        let a = Firewall::parse("permit c 10.*.*.*\npermit c *.*.*.*\n").unwrap();
        let b = Firewall::parse("permit c *.*.*.*\npermit c 10.*.*.*\n").unwrap();
        for addr in [ip(10, 0, 0, 1), ip(8, 8, 8, 8)] {
            assert_eq!(
                a.permits(Command::Connect, addr),
                b.permits(Command::Connect, addr)
            );
        }
    }

    #[test]
    fn test_malformed_lines() {
        for text in [
            "deny c 1.2.3.4\n",
            "permit x 1.2.3.4\n",
            "permit c 1.2.3\n",
            "permit c 1.2.3.4.5\n",
            "permit c 256.0.0.1\n",
            "permit c 1.2.3.+4\n",
            "permit c 1.2.3.4 extra\n",
            "permit c\n",
            "permit\n",
        ] {
            assert!(
                matches!(
                    Firewall::parse(text),
                    Err(FirewallError::Malformed { .. })
                ),
                "accepted malformed rule {text:?}"
            );
        }
    }

    #[test]
    fn test_malformed_line_number_reported() {
        let err = Firewall::parse("# ok\npermit c 1.2.3.4\nbogus line\n").unwrap_err();
        match err {
            FirewallError::Malformed { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_missing_file_is_error() {
        let missing = Path::new("/tmp/sockd_test_no_such_socks.conf");
        assert!(matches!(
            Firewall::load(missing).await,
            Err(FirewallError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("sockd_test_fw_{}.conf", std::process::id()));
        tokio::fs::write(&path, "permit b *.*.*.*\n").await.unwrap();
        let fw = Firewall::load(&path).await.unwrap();
        assert!(fw.permits(Command::Bind, ip(1, 2, 3, 4)));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
