use regex::Regex;

/// Client identity extracted from a peer user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub client_name: String,
    pub client_version: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patch: u32,
}

/// Normalizes a release string to four numeric components so that
/// `1.18.0`, `1.18.0.0` and `v1.18.0` all compare equal. Each dotted
/// component contributes its leading digits; suffixes like `rc1` fall away,
/// which deliberately makes release candidates equal to their base release.
pub fn normalize_version(version: &str) -> [u32; 4] {
    let stripped = version.trim().trim_start_matches(|c| c == 'v' || c == 'V');

    let mut normalized = [0_u32; 4];
    for (slot, component) in normalized.iter_mut().zip(stripped.split('.').take(4)) {
        let digits: String = component
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        *slot = digits.parse().unwrap_or(0);
    }
    normalized
}

pub fn versions_match(left: &str, right: &str) -> bool {
    normalize_version(left) == normalize_version(right)
}

/// Applies the configured user-agent pattern. Two capture groups mean
/// `(client, version)`; a single group is a bare version attributed to the
/// chain's reference client; no match leaves the raw string as the version
/// of an unknown client.
pub fn parse_user_agent(pattern: &Regex, user_agent: &str, default_client: &str) -> UserAgentInfo {
    let captures = match pattern.captures(user_agent) {
        Some(captures) => captures,
        None => return UserAgentInfo::unknown(user_agent),
    };

    let first = captures.get(1).map(|m| m.as_str());
    let second = captures.get(2).map(|m| m.as_str());
    let (client_name, client_version) = match (first, second) {
        (Some(name), Some(version)) => (name.to_string(), version.to_string()),
        (Some(version), None) => (default_client.to_string(), version.to_string()),
        _ => return UserAgentInfo::unknown(user_agent),
    };

    let mut numbers = client_version
        .split('.')
        .map(|part| part.parse().unwrap_or(0));

    UserAgentInfo {
        version_major: numbers.next().unwrap_or(0),
        version_minor: numbers.next().unwrap_or(0),
        version_patch: numbers.next().unwrap_or(0),
        client_name,
        client_version,
    }
}

impl UserAgentInfo {
    fn unknown(user_agent: &str) -> Self {
        UserAgentInfo {
            client_name: "Unknown".to_string(),
            client_version: user_agent.to_string(),
            version_major: 0,
            version_minor: 0,
            version_patch: 0,
        }
    }
}
