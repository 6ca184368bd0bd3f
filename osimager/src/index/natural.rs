//! Natural (version-aware) ordering: embedded digit runs compare as
//! integers, so `rhel-9.10-x86_64` sorts after `rhel-9.9-x86_64`.

use std::cmp::Ordering;

pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a_rest = a;
    let mut b_rest = b;

    loop {
        match (a_rest.is_empty(), b_rest.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        let a_digits = a_rest.starts_with(|c: char| c.is_ascii_digit());
        let b_digits = b_rest.starts_with(|c: char| c.is_ascii_digit());

        match (a_digits, b_digits) {
            (true, true) => {
                let (a_run, a_tail) = split_run(a_rest, true);
                let (b_run, b_tail) = split_run(b_rest, true);
                match cmp_digit_runs(a_run, b_run) {
                    Ordering::Equal => {
                        a_rest = a_tail;
                        b_rest = b_tail;
                    }
                    unequal => return unequal,
                }
            }
            (false, false) => {
                let (a_run, a_tail) = split_run(a_rest, false);
                let (b_run, b_tail) = split_run(b_rest, false);
                match a_run.cmp(b_run) {
                    Ordering::Equal => {
                        a_rest = a_tail;
                        b_rest = b_tail;
                    }
                    unequal => return unequal,
                }
            }
            // Digits sort before text so versions group ahead of suffixes.
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
        }
    }
}

fn split_run(s: &str, digits: bool) -> (&str, &str) {
    let end = s
        .find(|c: char| c.is_ascii_digit() != digits)
        .unwrap_or(s.len());
    s.split_at(end)
}

/// Compares two digit runs numerically without parsing, so arbitrarily long
/// runs cannot overflow: strip leading zeros, compare lengths, then compare
/// lexicographically.  Ties on value fall back to the raw text so that
/// zero-padded keys stay stably ordered.
fn cmp_digit_runs(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        .then_with(|| a.cmp(b))
}
