//! Lightweight source scanning
//!
//! Extracts the declared namespace and script type name from raw source so a
//! module can be named before it is compiled. Matching is ASCII
//! case-insensitive; identifiers are `[A-Za-z0-9_.]+`.

use std::path::Path;

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

/// Name following the first `namespace` keyword
pub fn extract_namespace(source: &str) -> Option<String> {
    let bytes = source.as_bytes();
    let lower = source.to_ascii_lowercase();
    let keyword = "namespace";

    let mut from = 0;
    while let Some(offset) = lower[from..].find(keyword) {
        let start = from + offset;
        let end = start + keyword.len();
        from = end;

        if start > 0 && is_ident(bytes[start - 1]) {
            continue;
        }
        let gap = bytes[end..]
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        if gap == 0 {
            continue;
        }
        let name_start = end + gap;
        let name_len = bytes[name_start..]
            .iter()
            .take_while(|b| is_ident(**b))
            .count();
        if name_len > 0 {
            return Some(source[name_start..name_start + name_len].to_string());
        }
    }
    None
}

/// Name of the first type declared as `Name : <contract>`
pub fn extract_class(source: &str, contract: &str) -> Option<String> {
    let bytes = source.as_bytes();
    let lower = source.to_ascii_lowercase();
    let contract = contract.to_ascii_lowercase();
    if contract.is_empty() {
        return None;
    }

    let mut from = 0;
    while let Some(offset) = lower[from..].find(&contract) {
        let start = from + offset;
        let end = start + contract.len();
        from = end;

        if bytes.get(end).copied().is_some_and(is_ident) {
            continue;
        }
        // Walk back over `\s*:\s*` to the identifier
        let mut i = start;
        while i > 0 && bytes[i - 1].is_ascii_whitespace() {
            i -= 1;
        }
        if i == 0 || bytes[i - 1] != b':' {
            continue;
        }
        i -= 1;
        while i > 0 && bytes[i - 1].is_ascii_whitespace() {
            i -= 1;
        }
        let name_end = i;
        while i > 0 && is_ident(bytes[i - 1]) {
            i -= 1;
        }
        if i < name_end {
            return Some(source[i..name_end].to_string());
        }
    }
    None
}

/// Module name for a compile request: the origin file stem, else the
/// scanned `namespace.Type`, else empty
pub fn module_name(source: &str, origin: Option<&Path>, contract: &str) -> String {
    if let Some(stem) = origin.and_then(Path::file_stem) {
        return stem.to_string_lossy().into_owned();
    }
    match (extract_namespace(source), extract_class(source, contract)) {
        (Some(ns), Some(class)) => format!("{ns}.{class}"),
        (None, Some(class)) => class,
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
using System;

namespace   SplatoonScriptsOfficial.Duties
{
    public class P8S_Towers :SplatoonScript
    {
    }
}
"#;

    #[test]
    fn test_extract_namespace() {
        assert_eq!(
            extract_namespace(SOURCE).as_deref(),
            Some("SplatoonScriptsOfficial.Duties")
        );
        assert_eq!(extract_namespace("NAMESPACE\tFoo_1;").as_deref(), Some("Foo_1"));
        assert_eq!(extract_namespace("mynamespace Foo"), None);
        assert_eq!(extract_namespace("namespaceFoo"), None);
        assert_eq!(extract_namespace("no declaration here"), None);
    }

    #[test]
    fn test_extract_class() {
        assert_eq!(
            extract_class(SOURCE, "SplatoonScript").as_deref(),
            Some("P8S_Towers")
        );
        assert_eq!(
            extract_class("class Bar : script {}", "Script").as_deref(),
            Some("Bar")
        );
        assert_eq!(extract_class("class Bar : ScriptBase", "Script"), None);
        assert_eq!(extract_class("uses Script only", "Script"), None);
    }

    #[test]
    fn test_module_name_prefers_origin() {
        assert_eq!(
            module_name(SOURCE, Some(Path::new("/s/Duties/Towers.cs")), "SplatoonScript"),
            "Towers"
        );
        assert_eq!(
            module_name(SOURCE, None, "SplatoonScript"),
            "SplatoonScriptsOfficial.Duties.P8S_Towers"
        );
        assert_eq!(module_name("(module)", None, "Script"), "");
    }
}
