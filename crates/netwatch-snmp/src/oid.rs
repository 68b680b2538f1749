//! Object identifiers used by the client

/// SNMP agent port
pub const SNMP_PORT: u16 = 161;

// system group, scalar instances
pub const SYS_DESCR: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 1, 0];
pub const SYS_OBJECT_ID: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 2, 0];
pub const SYS_UPTIME: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 3, 0];
pub const SYS_CONTACT: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 4, 0];
pub const SYS_NAME: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 5, 0];
pub const SYS_LOCATION: &[u64] = &[1, 3, 6, 1, 2, 1, 1, 6, 0];

// ifTable columns
pub const IF_DESCR: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 2];
pub const IF_SPEED: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 5];
pub const IF_IN_OCTETS: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 10];
pub const IF_OUT_OCTETS: &[u64] = &[1, 3, 6, 1, 2, 1, 2, 2, 1, 16];

// ifXTable 64-bit counters
pub const IF_HC_IN_OCTETS: &[u64] = &[1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 6];
pub const IF_HC_OUT_OCTETS: &[u64] = &[1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 10];

/// Parse a dotted OID (`1.3.6.1`, optionally with a leading dot)
pub fn parse_dotted(s: &str) -> Option<Vec<u64>> {
    let s = s.trim().trim_start_matches('.');
    if s.is_empty() {
        return None;
    }
    s.split('.').map(|arc| arc.parse().ok()).collect()
}

pub fn format_dotted(arcs: &[u64]) -> String {
    arcs.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Row index of `oid` if it is a direct instance of `column`
/// (`column` followed by exactly one arc).
pub fn column_index(column: &[u64], oid: &[u64]) -> Option<u32> {
    if oid.len() != column.len() + 1 || !oid.starts_with(column) {
        return None;
    }
    u32::try_from(oid[column.len()]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotted() {
        assert_eq!(parse_dotted("1.3.6.1.2.1.1.5.0").unwrap(), SYS_NAME.to_vec());
        assert_eq!(parse_dotted(".1.3.6").unwrap(), vec![1, 3, 6]);
        assert!(parse_dotted("").is_none());
        assert!(parse_dotted("1.3.x").is_none());
        assert!(parse_dotted("1..3").is_none());
    }

    #[test]
    fn test_format_dotted() {
        assert_eq!(format_dotted(IF_IN_OCTETS), "1.3.6.1.2.1.2.2.1.10");
    }

    #[test]
    fn test_column_index() {
        let mut row = IF_IN_OCTETS.to_vec();
        row.push(7);
        assert_eq!(column_index(IF_IN_OCTETS, &row), Some(7));

        // next column is outside the walk
        let mut next = IF_OUT_OCTETS.to_vec();
        next.push(1);
        assert_eq!(column_index(IF_IN_OCTETS, &next), None);

        // deeper instance is not a row of this table
        row.push(1);
        assert_eq!(column_index(IF_IN_OCTETS, &row), None);
    }
}
