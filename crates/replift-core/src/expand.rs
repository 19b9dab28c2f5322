use std::collections::HashSet;

/// Expands `%name%` variables in `text`. Undefined variables are left in
/// place (including their percent signs); defined values are expanded
/// recursively, with a visited set guarding against self-reference.
/// Variable names are matched case-insensitively.
pub fn expand(text: &str, resolver: &dyn Fn(&str) -> Option<String>) -> String {
    let mut visited = HashSet::new();
    expand_guarded(text, resolver, &mut visited)
}

fn expand_guarded(
    text: &str,
    resolver: &dyn Fn(&str) -> Option<String>,
    visited: &mut HashSet<String>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        let Some(end) = after.find('%') else {
            // no closing percent sign, keep the tail literally
            out.push_str(&rest[start..]);
            return out;
        };

        let name = after[..end].to_ascii_lowercase();
        let resolved = if visited.contains(&name) {
            None
        } else {
            resolver(&name)
        };

        match resolved {
            Some(value) => {
                visited.insert(name.clone());
                out.push_str(&expand_guarded(&value, resolver, visited));
                visited.remove(&name);
                rest = &after[end + 1..];
            }
            None => {
                // keep "%name" and rescan from the trailing percent sign,
                // which may open the next variable
                out.push_str(&rest[start..start + 1 + end]);
                rest = &after[end..];
            }
        }
    }

    out.push_str(rest);
    out
}
