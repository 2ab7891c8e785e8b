/// Minimal three-part version, ordered for floor lookups in
/// per-version offset tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Lenient parse: tolerates a leading `v` or `go` and trailing
    /// suffixes (`v15.0.0\n`, `go1.18rc1`, `1.21.3`). A missing patch
    /// or minor component parses as zero.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = s.strip_prefix("go").unwrap_or(s);
        let s = s.strip_prefix('v').unwrap_or(s);

        let mut parts = s.split('.');
        let major = parse_component(parts.next()?)?;
        let minor = parts.next().and_then(parse_component).unwrap_or(0);
        let patch = parts.next().and_then(parse_component).unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

fn parse_component(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Largest table entry not exceeding `ver`. The table must be sorted
/// ascending by version.
pub fn floor<'a, T>(table: &'a [(SemVer, T)], ver: SemVer) -> Option<&'a T> {
    table
        .iter()
        .rev()
        .find(|(entry_ver, _)| *entry_ver <= ver)
        .map(|(_, value)| value)
}
