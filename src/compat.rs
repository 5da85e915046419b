//! Irons out the differences between the Internet Archive's java wayback
//! CDX dialect and pywb.
//!
//! Callers always see pywb field names (`url`, `status`, `mime`); outgoing
//! filter expressions are rewritten to whichever dialect the target server
//! speaks.

use std::collections::BTreeMap;
use thiserror::Error;

pub const FIELDS_TO_PYWB: [(&str, &str); 3] = [
    ("statuscode", "status"),
    ("original", "url"),
    ("mimetype", "mime"),
];

const IA_UNSUPPORTED_OPS: [&str; 4] = ["=", "!=", "~", "!~"];

#[derive(Error, Debug)]
pub enum Error {
    #[error("ia does not support the filter {0}")]
    UnsupportedFilterOp(String),
}

pub fn to_pywb(field: &str) -> &str {
    for (ia, pywb) in FIELDS_TO_PYWB {
        if field == ia {
            return pywb;
        }
    }
    field
}

fn rewrite_first(expr: &str, from: &str, to: &str) -> String {
    // Rewrite only the first occurrence of `from:`; a leading `!` negation
    // stays at the front.
    let (neg, rest) = match expr.strip_prefix('!') {
        Some(rest) => ("!", rest),
        None => ("", expr),
    };
    let needle = format!("{}:", from);
    if let Some(pos) = rest.find(&needle) {
        // token must start at a field-name boundary
        let boundary = pos == 0
            || !rest[..pos]
                .chars()
                .next_back()
                .map(|c| c.is_ascii_alphanumeric() || c == '_')
                .unwrap_or(false);
        if boundary {
            return format!("{}{}{}:{}", neg, &rest[..pos], to, &rest[pos + needle.len()..]);
        }
    }
    format!("{}{}", neg, rest)
}

/// Translate filter expressions for the target source. `ia` rejects the
/// regex/exact operators pywb supports; everything else is assumed to be
/// pywb-shaped.
pub fn munge_filter(filters: &[String], source: &str) -> Result<Vec<String>, Error> {
    let mut ret = Vec::with_capacity(filters.len());
    for f in filters {
        let mut f = f.clone();
        if source == "ia" {
            for bad in IA_UNSUPPORTED_OPS {
                if f.starts_with(bad) {
                    return Err(Error::UnsupportedFilterOp(bad.to_string()));
                }
            }
            for (ia, pywb) in FIELDS_TO_PYWB {
                f = rewrite_first(&f, pywb, ia);
            }
        } else {
            for (ia, pywb) in FIELDS_TO_PYWB {
                f = rewrite_first(&f, ia, pywb);
            }
        }
        ret.push(f);
    }
    Ok(ret)
}

/// Decode IA's list-of-lists wire shape: the caller passes the first row
/// (field names) and the remaining rows, and gets back mappings keyed by
/// the pywb-normalized names.
pub fn munge_fields(fields: &[String], rows: &[Vec<String>]) -> Vec<BTreeMap<String, String>> {
    rows.iter()
        .map(|row| {
            fields
                .iter()
                .zip(row.iter())
                .map(|(f, v)| (to_pywb(f).to_string(), v.clone()))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Vec<String> {
        vec![v.to_string()]
    }

    #[test]
    fn filter_translation() {
        let tests = [
            ("foo", "foo", "foo"),
            ("!status:200", "!statuscode:200", "!status:200"),
            ("statuscode:200", "statuscode:200", "status:200"),
            ("url:foo", "original:foo", "url:foo"),
        ];
        for (t, ia, cc) in tests {
            assert_eq!(munge_filter(&s(t), "ia").unwrap(), s(ia));
            assert_eq!(munge_filter(&s(t), "cc").unwrap(), s(cc));
        }

        assert!(munge_filter(&s("!=status:200"), "ia").is_err());
        assert!(munge_filter(&s("~mime:.*html"), "ia").is_err());
    }

    #[test]
    fn only_first_occurrence_rewritten() {
        assert_eq!(
            munge_filter(&s("statuscode:statuscode:1"), "cc").unwrap(),
            s("status:statuscode:1")
        );
    }

    #[test]
    fn field_normalization() {
        let fields = vec!["statuscode".to_string(), "original".to_string()];
        let rows = vec![vec!["200".to_string(), "http://example.com/".to_string()]];
        let out = munge_fields(&fields, &rows);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["status"], "200");
        assert_eq!(out[0]["url"], "http://example.com/");
    }
}
