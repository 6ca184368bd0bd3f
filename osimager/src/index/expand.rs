//! Version range expansion.
//!
//! A spec's `provides.versions` entries are strings with optional bracketed
//! groups: `[a-b]` is an inclusive integer range, `[a,b,c]` an enumeration.
//! Multiple groups in one string produce the cartesian product.  A plain
//! string is used verbatim.  Mixing a range and a list in one group is
//! rejected.

use snafu::ensure;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Unclosed '[' in version string '{}'", pattern))]
        UnclosedGroup { pattern: String },

        #[snafu(display(
            "Version group '[{}]' in '{}' mixes range and list syntax",
            group,
            pattern
        ))]
        MixedGroup { group: String, pattern: String },

        #[snafu(display("Bad range endpoint '{}' in '{}'", endpoint, pattern))]
        BadEndpoint { endpoint: String, pattern: String },

        #[snafu(display("Range '[{}]' in '{}' runs backwards", group, pattern))]
        BackwardsRange { group: String, pattern: String },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

/// Expands one version declaration into the versions it covers, in order.
pub fn expand_versions(pattern: &str) -> Result<Vec<String>> {
    // Split into alternating literal text and bracketed groups.
    let mut parts: Vec<Vec<String>> = Vec::new();
    let mut rest = pattern;
    while let Some(open) = rest.find('[') {
        if open > 0 {
            parts.push(vec![rest[..open].to_string()]);
        }
        let after = &rest[open + 1..];
        let close = match after.find(']') {
            Some(close) => close,
            None => return error::UnclosedGroupSnafu { pattern }.fail(),
        };
        parts.push(expand_group(&after[..close], pattern)?);
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        parts.push(vec![rest.to_string()]);
    }
    if parts.is_empty() {
        return Ok(vec![String::new()]);
    }

    // Cartesian product across groups, preserving group order.
    let mut expanded = vec![String::new()];
    for part in parts {
        let mut next = Vec::with_capacity(expanded.len() * part.len());
        for prefix in &expanded {
            for item in &part {
                next.push(format!("{}{}", prefix, item));
            }
        }
        expanded = next;
    }
    Ok(expanded)
}

fn expand_group(group: &str, pattern: &str) -> Result<Vec<String>> {
    let has_range = group.contains('-');
    let has_list = group.contains(',');
    ensure!(
        !(has_range && has_list),
        error::MixedGroupSnafu { group, pattern }
    );

    if has_list {
        return Ok(group.split(',').map(|item| item.trim().to_string()).collect());
    }

    if has_range {
        let (start, end) = group.split_once('-').unwrap();
        let (start, end) = (start.trim(), end.trim());
        let a: u64 = start
            .parse()
            .map_err(|_| error::BadEndpointSnafu { endpoint: start, pattern }.build())?;
        let b: u64 = end
            .parse()
            .map_err(|_| error::BadEndpointSnafu { endpoint: end, pattern }.build())?;
        ensure!(a <= b, error::BackwardsRangeSnafu { group, pattern });

        // Zero-padding of the endpoints is preserved in the output.
        let width = if start.starts_with('0') || end.starts_with('0') {
            start.len().max(end.len())
        } else {
            0
        };
        return Ok((a..=b).map(|n| format!("{:0width$}", n, width = width)).collect());
    }

    // A group with a single member behaves like a one-element enumeration.
    Ok(vec![group.trim().to_string()])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn simple_range() {
        assert_eq!(expand_versions("8.[3-5]").unwrap(), ["8.3", "8.4", "8.5"]);
    }

    #[test]
    fn zero_padded_range() {
        assert_eq!(
            expand_versions("12.[01-03]").unwrap(),
            ["12.01", "12.02", "12.03"]
        );
    }

    #[test]
    fn enumeration() {
        assert_eq!(
            expand_versions("5.[1,9,10]").unwrap(),
            ["5.1", "5.9", "5.10"]
        );
    }

    #[test]
    fn plain_string_verbatim() {
        assert_eq!(expand_versions("15-SP6").unwrap(), ["15-SP6"]);
        assert_eq!(expand_versions("2025").unwrap(), ["2025"]);
    }

    #[test]
    fn cartesian_product() {
        assert_eq!(
            expand_versions("[8,9].[0-1]").unwrap(),
            ["8.0", "8.1", "9.0", "9.1"]
        );
    }

    #[test]
    fn range_length_law() {
        // x.[a-b] produces exactly b-a+1 entries
        assert_eq!(expand_versions("7.[2-9]").unwrap().len(), 8);
        assert_eq!(expand_versions("7.[1,2,3]").unwrap().len(), 3);
    }

    #[test]
    fn mixed_group_rejected() {
        assert!(matches!(
            expand_versions("9.[1-3,5]").unwrap_err(),
            Error::MixedGroup { .. }
        ));
    }

    #[test]
    fn unclosed_group_rejected() {
        assert!(matches!(
            expand_versions("9.[1-3").unwrap_err(),
            Error::UnclosedGroup { .. }
        ));
    }

    #[test]
    fn backwards_range_rejected() {
        assert!(matches!(
            expand_versions("9.[5-3]").unwrap_err(),
            Error::BackwardsRange { .. }
        ));
    }
}
