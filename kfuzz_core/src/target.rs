use std::fmt;

/// Identity of one method under test, e.g. `org.example.JsonTests.parse`.
///
/// The qualified name doubles as the stem of every per-target file in the
/// artifact store, so characters that cannot appear in a file name are
/// replaced when a file stem is requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuzzTarget {
    name: String,
}

impl FuzzTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_stem(&self) -> String {
        self.name
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_whitespace() => '_',
                c => c,
            })
            .collect()
    }

    /// Splits the qualified name into its owner path and the method name.
    /// Both `.` and `::` are accepted as separators.
    pub fn split_owner(&self) -> (Vec<&str>, &str) {
        let mut segments: Vec<&str> = self
            .name
            .split("::")
            .flat_map(|s| s.split('.'))
            .filter(|s| !s.is_empty())
            .collect();
        let method = segments.pop().unwrap_or("");
        (segments, method)
    }
}

impl fmt::Display for FuzzTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stem_replaces_path_separators() {
        let target = FuzzTarget::new("a/b c:d");
        assert_eq!(target.file_stem(), "a_b_c_d");
        assert_eq!(
            FuzzTarget::new("org.example.Json.parse").file_stem(),
            "org.example.Json.parse"
        );
    }

    #[test]
    fn split_owner_handles_both_separators() {
        let dotted = FuzzTarget::new("org.example.Json.parse");
        assert_eq!(dotted.split_owner(), (vec!["org", "example", "Json"], "parse"));

        let pathed = FuzzTarget::new("parser::tests::fuzz_json");
        assert_eq!(pathed.split_owner(), (vec!["parser", "tests"], "fuzz_json"));

        let bare = FuzzTarget::new("entry");
        assert_eq!(bare.split_owner(), (Vec::<&str>::new(), "entry"));
    }
}
