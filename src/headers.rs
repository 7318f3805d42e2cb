use std::collections::{HashMap, HashSet};

/// Gives every repeated header a unique name.
///
/// The first occurrence of a header keeps its name; the Nth occurrence of the
/// same header becomes `H__N`, counting from 2. Order and length are preserved.
/// A suffix that would collide with a header already present in the file is
/// skipped, so the output never contains the same name twice.
pub fn normalize_duplicate_headers(headers: &[String]) -> Vec<String> {
    let originals: HashSet<&str> = headers.iter().map(String::as_str).collect();
    let mut occurrences: HashMap<&str, usize> = HashMap::with_capacity(headers.len());
    let mut emitted: HashSet<String> = HashSet::with_capacity(headers.len());
    let mut normalized = Vec::with_capacity(headers.len());

    for header in headers {
        let count = occurrences.entry(header.as_str()).or_insert(0);
        *count += 1;
        let name = if *count == 1 && !emitted.contains(header) {
            header.clone()
        } else {
            let mut suffix = (*count).max(2);
            loop {
                let candidate = format!("{header}__{suffix}");
                if !originals.contains(candidate.as_str()) && !emitted.contains(&candidate) {
                    break candidate;
                }
                suffix += 1;
            }
        };
        emitted.insert(name.clone());
        normalized.push(name);
    }
    normalized
}
