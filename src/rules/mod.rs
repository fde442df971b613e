//! The rule grammar: `pattern[:port][=replacement[:port]]` tokens,
//! semicolon-separated, evaluated first-match-wins against connect and
//! name-lookup calls.

mod glob;

use std::net::Ipv4Addr;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use self::glob::glob_match;
use crate::error::{HookError, HookResult};

/// Hostname for the built-in catch-all, kept out of Steam's CDN by default
/// unless a custom rule earlier in the set overrides it. `?` matches the
/// single digit in `content1.steampowered.com`, `content2...`, etc.
const STEAM_CDN_GLOB: &str = "content?.steampowered.com";

/// Steam's conventional content-server port. Carried alongside the rule set
/// for parity with the data model this crate is grounded on; see
/// `DESIGN.md`'s Open Question entry for why no operation here consults it.
pub const STEAM_CDN_PORT: u16 = 27030;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Host(String),
    Numeric { addr: u32, mask: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Passthrough,
    Deny,
    Rewrite {
        addr: Option<Ipv4Addr>,
        port: Option<u16>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    pattern: Pattern,
    match_port: Option<u16>,
    action: Action,
}

impl Rule {
    fn matches_numeric(&self, addr: Ipv4Addr, port: u16) -> bool {
        match self.pattern {
            Pattern::Numeric { addr: rule_addr, mask } => {
                (u32::from(addr) & mask) == (rule_addr & mask)
                    && self.match_port.is_none_or(|p| p == port)
            }
            Pattern::Host(_) => false,
        }
    }

    fn matches_host(&self, name: &str) -> bool {
        match &self.pattern {
            Pattern::Host(glob) => glob_match(glob, name),
            Pattern::Numeric { .. } => false,
        }
    }
}

impl Action {
    fn resolve(self, caller_addr: Ipv4Addr, caller_port: u16) -> Decision {
        match self {
            Action::Passthrough => Decision::Forward,
            Action::Deny => Decision::Deny,
            Action::Rewrite { addr, port } => Decision::RewriteTo {
                addr: addr.unwrap_or(caller_addr),
                port: port.unwrap_or(caller_port),
            },
        }
    }
}

/// The outcome of evaluating a rule set against a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Forward,
    Deny,
    RewriteTo { addr: Ipv4Addr, port: u16 },
}

fn split_port(s: &str) -> HookResult<(&str, Option<u16>)> {
    match s.rsplit_once(':') {
        Some((host, port_str)) if !port_str.is_empty() && port_str.bytes().all(|b| b.is_ascii_digit()) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| HookError::RuleParse(format!("bad port \"{port_str}\"")))?;
            Ok((host, Some(port)))
        }
        _ => Ok((s, None)),
    }
}

fn parse_pattern(s: &str) -> HookResult<Pattern> {
    if s.is_empty() {
        return Err(HookError::RuleParse("empty match pattern".into()));
    }
    if let Some((addr_str, prefix_str)) = s.split_once('/') {
        let addr: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| HookError::RuleParse(format!("bad address \"{addr_str}\"")))?;
        let prefix: u32 = prefix_str
            .parse()
            .map_err(|_| HookError::RuleParse(format!("bad prefix \"{prefix_str}\"")))?;
        if prefix > 32 {
            return Err(HookError::RuleParse(format!("prefix /{prefix} out of range")));
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        Ok(Pattern::Numeric {
            addr: u32::from(addr) & mask,
            mask,
        })
    } else if let Ok(addr) = s.parse::<Ipv4Addr>() {
        Ok(Pattern::Numeric {
            addr: u32::from(addr),
            mask: u32::MAX,
        })
    } else {
        Ok(Pattern::Host(s.to_string()))
    }
}

fn parse_action(replacement: Option<&str>) -> HookResult<Action> {
    let Some(replacement) = replacement else {
        return Ok(Action::Deny);
    };
    let (addr_str, port) = split_port(replacement)?;
    if addr_str.is_empty() {
        Ok(Action::Deny)
    } else if addr_str == "0.0.0.0" {
        Ok(Action::Passthrough)
    } else {
        let addr: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| HookError::RuleParse(format!("bad replacement address \"{addr_str}\"")))?;
        Ok(Action::Rewrite {
            addr: Some(addr),
            port,
        })
    }
}

fn parse_rule(token: &str) -> HookResult<Rule> {
    let (match_part, replacement_part) = match token.split_once('=') {
        Some((m, r)) => (m, Some(r)),
        None => (token, None),
    };
    let (pattern_str, match_port) = split_port(match_part)?;
    let pattern = parse_pattern(pattern_str)?;
    let action = parse_action(replacement_part)?;
    Ok(Rule {
        pattern,
        match_port,
        action,
    })
}

fn parse_rules(input: &str) -> HookResult<Vec<Rule>> {
    let mut rules = Vec::new();
    for token in input.split(';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        rules.push(parse_rule(token)?);
    }
    Ok(rules)
}

static CATCH_ALL: LazyLock<Rule> = LazyLock::new(|| Rule {
    pattern: Pattern::Host(STEAM_CDN_GLOB.to_string()),
    match_port: None,
    action: Action::Deny,
});

/// An ordered, immutable set of rules evaluated first-match-wins.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn empty() -> Self {
        RuleSet { rules: Vec::new() }
    }

    pub fn parse(input: &str) -> HookResult<Self> {
        Ok(RuleSet {
            rules: parse_rules(input)?,
        })
    }

    pub fn appended(&self, input: &str) -> HookResult<Self> {
        let mut rules = self.rules.clone();
        rules.extend(parse_rules(input)?);
        Ok(RuleSet { rules })
    }

    fn rules_with_catch_all(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().chain(std::iter::once(&*CATCH_ALL))
    }

    pub fn decide_connect(&self, addr: Ipv4Addr, port: u16) -> Decision {
        for rule in self.rules_with_catch_all() {
            if rule.matches_numeric(addr, port) {
                return rule.action.resolve(addr, port);
            }
        }
        Decision::Forward
    }

    pub fn decide_host(&self, name: &str) -> Decision {
        for rule in self.rules_with_catch_all() {
            if rule.matches_host(name) {
                // Name lookups have no caller-supplied address/port to fall
                // back to; a bare Rewrite without an explicit address only
                // makes sense for connect-time rules, so treat it as deny.
                return match rule.action {
                    Action::Passthrough => Decision::Forward,
                    Action::Deny => Decision::Deny,
                    Action::Rewrite { addr: Some(addr), port } => Decision::RewriteTo {
                        addr,
                        port: port.unwrap_or(0),
                    },
                    Action::Rewrite { addr: None, .. } => Decision::Deny,
                };
            }
        }
        Decision::Forward
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::empty()
    }
}

/// Hot-swappable holder for the active [`RuleSet`], read by every detour and
/// written only by `install`/`unload`.
pub struct RuleStore {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleStore {
    pub fn new() -> Self {
        RuleStore {
            current: RwLock::new(Arc::new(RuleSet::empty())),
        }
    }

    /// Replaces the active rule set outright.
    pub fn install(&self, input: &str) -> HookResult<()> {
        let set = RuleSet::parse(input)?;
        *self.current.write() = Arc::new(set);
        Ok(())
    }

    /// Merges rules into the active set without discarding what is there.
    pub fn append(&self, input: &str) -> HookResult<()> {
        let appended = self.current.read().appended(input)?;
        *self.current.write() = Arc::new(appended);
        Ok(())
    }

    /// An immutable snapshot, safe to consult without holding any lock.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_rule_rewrites_address_and_port() {
        let set = RuleSet::parse("1.2.3.4:80=5.6.7.8").unwrap();
        let decision = set.decide_connect(Ipv4Addr::new(1, 2, 3, 4), 80);
        assert_eq!(
            decision,
            Decision::RewriteTo {
                addr: Ipv4Addr::new(5, 6, 7, 8),
                port: 80
            }
        );
    }

    #[test]
    fn numeric_rule_preserves_caller_port_when_unspecified() {
        let set = RuleSet::parse("1.2.3.4=5.6.7.8").unwrap();
        let decision = set.decide_connect(Ipv4Addr::new(1, 2, 3, 4), 443);
        assert_eq!(
            decision,
            Decision::RewriteTo {
                addr: Ipv4Addr::new(5, 6, 7, 8),
                port: 443
            }
        );
    }

    #[test]
    fn non_matching_numeric_rule_forwards() {
        let set = RuleSet::parse("1.2.3.4=5.6.7.8").unwrap();
        assert_eq!(
            set.decide_connect(Ipv4Addr::new(9, 9, 9, 9), 443),
            Decision::Forward
        );
    }

    #[test]
    fn bare_host_pattern_denies() {
        let set = RuleSet::parse("bad.example.com").unwrap();
        assert_eq!(set.decide_host("bad.example.com"), Decision::Deny);
    }

    #[test]
    fn explicit_empty_replacement_denies() {
        let set = RuleSet::parse("bad.example.com=").unwrap();
        assert_eq!(set.decide_host("bad.example.com"), Decision::Deny);
    }

    #[test]
    fn zero_address_replacement_passes_through() {
        let set = RuleSet::parse("*.example.com=0.0.0.0").unwrap();
        assert_eq!(set.decide_host("www.example.com"), Decision::Forward);
    }

    #[test]
    fn built_in_catch_all_denies_steam_cdn_by_default() {
        let set = RuleSet::empty();
        assert_eq!(
            set.decide_host("content1.steampowered.com"),
            Decision::Deny
        );
    }

    #[test]
    fn custom_rule_overrides_catch_all_when_earlier_in_order() {
        let set = RuleSet::parse("content1.steampowered.com=0.0.0.0").unwrap();
        assert_eq!(
            set.decide_host("content1.steampowered.com"),
            Decision::Forward
        );
        assert_eq!(
            set.decide_host("content2.steampowered.com"),
            Decision::Deny
        );
    }

    #[test]
    fn first_match_wins_over_later_rules() {
        let set = RuleSet::parse("1.2.3.4=0.0.0.0;1.2.3.4=9.9.9.9").unwrap();
        assert_eq!(
            set.decide_connect(Ipv4Addr::new(1, 2, 3, 4), 1),
            Decision::Forward
        );
    }

    #[test]
    fn install_replaces_while_append_merges() {
        let store = RuleStore::new();
        store.install("1.2.3.4=0.0.0.0").unwrap();
        store.append("5.6.7.8=").unwrap();
        let snap = store.snapshot();
        assert_eq!(
            snap.decide_connect(Ipv4Addr::new(1, 2, 3, 4), 1),
            Decision::Forward
        );
        assert_eq!(
            snap.decide_connect(Ipv4Addr::new(5, 6, 7, 8), 1),
            Decision::Deny
        );

        store.install("5.6.7.8=").unwrap();
        let snap2 = store.snapshot();
        assert_eq!(
            snap2.decide_connect(Ipv4Addr::new(1, 2, 3, 4), 1),
            Decision::Forward
        );
    }

    #[test]
    fn mask_prefix_matches_subnet() {
        let set = RuleSet::parse("10.0.0.0/8=").unwrap();
        assert_eq!(
            set.decide_connect(Ipv4Addr::new(10, 1, 2, 3), 80),
            Decision::Deny
        );
        assert_eq!(
            set.decide_connect(Ipv4Addr::new(11, 1, 2, 3), 80),
            Decision::Forward
        );
    }

    #[test]
    fn rejects_malformed_prefix() {
        assert!(RuleSet::parse("10.0.0.0/33=").is_err());
    }

    #[test]
    fn empty_string_matches_nothing() {
        let set = RuleSet::parse("").unwrap();
        assert_eq!(
            set.decide_connect(Ipv4Addr::new(1, 2, 3, 4), 80),
            Decision::Forward
        );
    }
}
