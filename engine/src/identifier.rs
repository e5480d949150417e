//! Table and column name rules: length limits, case-insensitive uniqueness and laundering.

use std::collections::HashMap;

use tracing::debug;

#[derive(Copy, Clone, Debug, Default)]
pub struct IdentifierRules {
    pub max_length: Option<usize>,
    pub case_insensitive: bool,
    /// Lower-case names and replace anything but ASCII letters, digits and `_`
    pub postgresql_laundering: bool,
}

impl IdentifierRules {
    fn key(&self, name: &str) -> String {
        if self.case_insensitive {
            name.to_uppercase()
        } else {
            name.to_string()
        }
    }

    /// Applies laundering and truncation to a single name.
    pub fn normalize(&self, name: &str) -> String {
        let name = if self.postgresql_laundering {
            launder_postgresql(name)
        } else {
            name.to_string()
        };
        match self.max_length {
            Some(max) if name.chars().count() > max => truncate(&name, max),
            _ => name,
        }
    }

    /// Makes every name of `names` distinct, truncating names over the limit first and then
    /// numbering duplicates in order of appearance.
    pub fn make_unique(&self, names: &mut [String]) {
        for name in names.iter_mut() {
            *name = self.normalize(name);
        }
        for _ in 0..16 {
            let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
            for (i, name) in names.iter().enumerate() {
                groups.entry(self.key(name)).or_default().push(i);
            }
            let mut duplicates = groups
                .into_values()
                .filter(|g| g.len() > 1)
                .collect::<Vec<_>>();
            if duplicates.is_empty() {
                return;
            }
            duplicates.sort();
            for group in duplicates {
                for (occurrence, &i) in group.iter().enumerate() {
                    names[i] = add_serial_number(&names[i], occurrence + 1, group.len(), self.max_length);
                }
            }
        }
        debug!("Identifiers still not unique after renaming");
    }
}

/// Lower-cases `name` and replaces the characters PostgreSQL would need quoted.
pub fn launder_postgresql(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

/// Appends the `occurrence`-th serial number, zero padded to the width of `total`, making room
/// for it when the name would exceed `max_length`.
pub fn add_serial_number(
    name: &str,
    occurrence: usize,
    total: usize,
    max_length: Option<usize>,
) -> String {
    let width = total.to_string().len();
    let digits = format!("{occurrence:0width$}");
    let length = name.chars().count();
    match max_length {
        Some(max) if length + width > max => {
            let keep = max.saturating_sub(width);
            let mut truncated = name.chars().take(keep).collect::<String>();
            truncated.push_str(&digits);
            truncated
        }
        _ => format!("{name}{digits}"),
    }
}

/// Shortens `name` to `max_length` characters.
///
/// The name is split on underscores and camel-case boundaries, and the longest part loses its last
/// character until the name fits. The last part is only shortened when it is more than twice as
/// long as every other. If every part is down to one character, the beginning of the name is cut.
pub fn truncate(name: &str, max_length: usize) -> String {
    let mut extra = name.chars().count().saturating_sub(max_length);
    if extra == 0 {
        return name.to_string();
    }

    // (preceded by an underscore, characters)
    let mut tokens: Vec<(bool, Vec<char>)> = Vec::new();
    for (j, token) in name.split('_').enumerate() {
        let chars = token.chars().collect::<Vec<_>>();
        match split_camel_case(&chars) {
            Some(parts) => {
                for (k, part) in parts.into_iter().enumerate() {
                    tokens.push((j > 0 && k == 0, part));
                }
            }
            None => tokens.push((j > 0, chars)),
        }
    }

    while extra > 0 {
        let mut max_size = 0;
        let mut index = 0;
        for (j, (_, token)) in tokens.iter().enumerate() {
            let len = token.len();
            if len > max_size && (j + 1 < tokens.len() || len > 2 * max_size) {
                max_size = len;
                index = j;
            }
        }
        if max_size <= 1 {
            break;
        }
        tokens[index].1.pop();
        extra -= 1;
    }

    let mut result = String::new();
    for (underscore, token) in &tokens {
        if *underscore {
            result.push('_');
        }
        result.extend(token);
    }
    if extra > 0 {
        result = result.chars().skip(extra).collect();
    }
    result
}

/// `camelCase` or `CamelCase` into its words; `None` when the token is not camel case.
fn split_camel_case(token: &[char]) -> Option<Vec<Vec<char>>> {
    if token.len() < 2 || !token[1].is_lowercase() {
        return None;
    }
    let mut parts = Vec::new();
    let mut current = token[..2].to_vec();
    let mut last_is_lower = true;
    for &c in &token[2..] {
        if c.is_uppercase() {
            if !last_is_lower {
                return None;
            }
            parts.push(std::mem::take(&mut current));
            last_is_lower = false;
        } else {
            last_is_lower = true;
        }
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    Some(parts)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn truncate_longest_parts_first() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij_klm", 10), "abcdef_klm");
        assert_eq!(
            truncate("featureMember_geometryProperty", 20),
            "feaMemb_geomProperty"
        );
        assert_eq!(truncate("a_b_c_d_e_f_g_h_i_j_k", 10).chars().count(), 10);
    }

    #[test]
    fn truncation_is_deterministic() {
        let a = truncate("AVeryLongFeatureTypeName_withSomeProperty", 16);
        let b = truncate("AVeryLongFeatureTypeName_withSomeProperty", 16);
        assert_eq!(a, b);
        assert_eq!(a.chars().count(), 16);
    }

    #[test]
    fn serial_numbers() {
        assert_eq!(add_serial_number("name", 2, 3, None), "name2");
        assert_eq!(add_serial_number("name", 2, 12, None), "name02");
        assert_eq!(add_serial_number("abcdefghij", 1, 2, Some(10)), "abcdefghi1");
    }

    #[test]
    fn unique_after_truncation() {
        let rules = IdentifierRules {
            max_length: Some(12),
            case_insensitive: true,
            postgresql_laundering: false,
        };
        let mut names = (0..30)
            .map(|i| format!("SomeQuiteLongPrefix_{i}"))
            .chain(["Item".into(), "ITEM".into(), "item1".into()])
            .collect::<Vec<_>>();
        rules.make_unique(&mut names);
        let distinct = names.iter().map(|n| n.to_uppercase()).collect::<HashSet<_>>();
        assert_eq!(distinct.len(), names.len());
        assert!(names.iter().all(|n| n.chars().count() <= 12));
    }

    #[test]
    fn postgresql_laundering() {
        assert_eq!(launder_postgresql("My-Layer#1"), "my_layer_1");
        let rules = IdentifierRules {
            postgresql_laundering: true,
            ..Default::default()
        };
        assert_eq!(rules.normalize("Foo_Bar"), "foo_bar");
    }
}
