//! Attack classification
//!
//! Turns HTTP request fields and captured credentials into attack tags and a
//! threat level. Everything here is pure: the same input always produces the
//! same [`Classification`].

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, BuildError, MatchKind};

use crate::models::{AttackTag, ThreatLevel};

/// Default credential pairs shipped on consumer IoT devices.
pub const IOT_DEFAULT_CREDENTIALS: [(&str, &str); 15] = [
    ("admin", "admin"),
    ("root", "root"),
    ("admin", "password"),
    ("root", "password"),
    ("admin", "123456"),
    ("root", "123456"),
    ("user", "user"),
    ("guest", "guest"),
    ("support", "support"),
    ("admin", ""),
    ("root", ""),
    ("", ""),
    ("admin", "1234"),
    ("root", "toor"),
    ("admin", "pass"),
];

/// Tags and overall level for one observation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Classification {
    /// Matched tags in rule order, without duplicates
    pub tags: Vec<AttackTag>,
    /// Highest severity among matched rules, `Low` when nothing matched
    pub level: ThreatLevel,
}

impl Classification {
    pub fn single(tag: AttackTag, level: ThreatLevel) -> Self {
        Self {
            tags: vec![tag],
            level,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    fn add(&mut self, tag: AttackTag, level: ThreatLevel) {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self.level = self.level.max(level);
    }
}

/// Classify a captured credential pair.
///
/// Pairs from [`IOT_DEFAULT_CREDENTIALS`] point at botnet scanners; anything
/// else is ordinary brute forcing.
pub fn classify_credentials(username: &str, password: &str) -> Classification {
    if is_iot_default(username, password) {
        Classification::single(AttackTag::IotBotnet, ThreatLevel::High)
    } else {
        Classification::single(AttackTag::BruteForce, ThreatLevel::Medium)
    }
}

pub fn is_iot_default(username: &str, password: &str) -> bool {
    IOT_DEFAULT_CREDENTIALS
        .iter()
        .any(|(u, p)| *u == username && *p == password)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Uri,
    UserAgent,
}

struct Rule {
    tag: AttackTag,
    level: ThreatLevel,
    field: Field,
    matcher: AhoCorasick,
}

/// Rule table as (tag, level, field, substrings), evaluated in this order.
const RULES: &[(AttackTag, ThreatLevel, Field, &[&str])] = &[
    (
        AttackTag::SqlInjection,
        ThreatLevel::High,
        Field::Uri,
        &[
            "union", "select", "insert", "update", "delete", "drop", "create", "alter", "'",
            "\"", "--", "/*",
        ],
    ),
    (
        AttackTag::Xss,
        ThreatLevel::High,
        Field::Uri,
        &[
            "<script",
            "javascript:",
            "onload=",
            "onerror=",
            "alert(",
            "document.cookie",
        ],
    ),
    (
        AttackTag::DirectoryTraversal,
        ThreatLevel::Medium,
        Field::Uri,
        &["../", "..\\"],
    ),
    (
        AttackTag::AdminAccess,
        ThreatLevel::Medium,
        Field::Uri,
        &[
            "admin",
            "wp-admin",
            "phpmyadmin",
            "login",
            "administrator",
            "manager",
        ],
    ),
    (
        AttackTag::AutomatedScan,
        ThreatLevel::Medium,
        Field::UserAgent,
        &["bot", "crawler", "scanner", "nikto", "sqlmap", "nmap", "masscan"],
    ),
    (
        AttackTag::FileInclusion,
        ThreatLevel::High,
        Field::Uri,
        &["include", "require"],
    ),
    (
        AttackTag::CommandInjection,
        ThreatLevel::High,
        Field::Uri,
        &["|", ";", "&&", "||", "`", "$", "$("],
    ),
];

/// HTTP request classifier built from a fixed substring rule table
pub struct HttpClassifier {
    rules: Vec<Rule>,
}

impl HttpClassifier {
    pub fn new() -> Result<Self, BuildError> {
        let mut rules = Vec::with_capacity(RULES.len());
        for (tag, level, field, patterns) in RULES {
            let matcher = AhoCorasickBuilder::new()
                .match_kind(MatchKind::LeftmostFirst)
                .ascii_case_insensitive(true)
                .build(patterns.iter())?;
            rules.push(Rule {
                tag: *tag,
                level: *level,
                field: *field,
                matcher,
            });
        }
        Ok(Self { rules })
    }

    /// Classify one request.
    ///
    /// The URI is checked both as received and percent-decoded. The method
    /// does not feed any rule today.
    pub fn classify(&self, _method: &str, uri: &str, user_agent: &str) -> Classification {
        let uri = uri.to_lowercase();
        let decoded = percent_decode(&uri).to_lowercase();
        let user_agent = user_agent.to_lowercase();

        let mut result = Classification::default();
        for rule in &self.rules {
            let hit = match rule.field {
                Field::Uri => rule.matcher.is_match(&uri) || rule.matcher.is_match(&decoded),
                Field::UserAgent => rule.matcher.is_match(&user_agent),
            };
            if hit {
                result.add(rule.tag, rule.level);
            }
        }
        result
    }
}

/// Decode `%XX` escapes and `+`. Malformed escapes are kept literally.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
