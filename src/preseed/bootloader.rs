//! Kernel command line patching for GRUB and isolinux configs.
//!
//! Only `linux`/`linuxefi` (GRUB) and `append` (isolinux) lines change. Any
//! parameter this tool owns is dropped first, then the new set is inserted
//! before the `---` separator, so patching twice gives the same file.

/// Parameter keys (or bare flags) owned by the preseed patch.
const OWNED_KEYS: &[&str] = &[
    "auto",
    "priority",
    "preseed/file",
    "file",
    "debian-installer/locale",
    "locale",
    "keyboard-configuration/layoutcode",
    "netcfg/get_hostname",
    "hostname",
];

fn owned(token: &str) -> bool {
    let key = token.split_once('=').map(|(k, _)| k).unwrap_or(token);
    OWNED_KEYS.contains(&key)
}

fn patch_line(line: &str, keyword: &str, params: &[&str]) -> Option<String> {
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];
    let rest = trimmed.strip_prefix(keyword)?;
    if !rest.starts_with(|c: char| c.is_whitespace()) {
        return None;
    }

    let mut tokens: Vec<&str> = rest.split_whitespace().filter(|t| !owned(t)).collect();
    let at = tokens.iter().position(|t| *t == "---").unwrap_or(tokens.len());
    for (i, param) in params.iter().enumerate() {
        tokens.insert(at + i, *param);
    }
    Some(format!("{}{} {}", indent, keyword, tokens.join(" ")))
}

fn patch(content: &str, keywords: &[&str], params: &str) -> (String, usize) {
    let params: Vec<&str> = params.split_whitespace().collect();
    let mut patched = 0;
    let mut out: Vec<String> = Vec::new();
    for line in content.lines() {
        let replaced = keywords
            .iter()
            .find_map(|keyword| patch_line(line, keyword, &params));
        match replaced {
            Some(new_line) => {
                patched += 1;
                out.push(new_line);
            }
            None => out.push(line.to_string()),
        }
    }
    let mut text = out.join("\n");
    if content.ends_with('\n') {
        text.push('\n');
    }
    (text, patched)
}

/// Patch every kernel line of a `grub.cfg`. Returns the text and line count.
pub fn patch_grub(content: &str, params: &str) -> (String, usize) {
    patch(content, &["linuxefi", "linux"], params)
}

/// Patch every `append` line of an isolinux config.
pub fn patch_isolinux(content: &str, params: &str) -> (String, usize) {
    patch(content, &["append"], params)
}
