//! Parsers for gpg's human-readable output.
//!
//! These match the layout printed by GnuPG 1.4 and are the only place that
//! depends on it. None of them panic on arbitrary input.

/// Fingerprint from `gpg --fingerprint` output, spaces removed.
///
/// Uses the first line mentioning `fingerprint` that has an `=`.
#[must_use]
pub fn fingerprint(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.contains("fingerprint"))
        .find_map(|line| line.split('=').nth(1))
        .map(|fp| fp.chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .filter(|fp| !fp.is_empty())
}

/// Key id of the first key reported by `gpg -v --import`.
///
/// The second diagnostic line reads `gpg: pub  2048R/<id>  <date> ...`;
/// split on single spaces the algorithm/id cell is the fourth one.
#[must_use]
pub fn import_key_id(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr.split('\n').collect();
    if lines.len() <= 2 {
        return None;
    }
    let cell = lines[1].split(' ').nth(3)?;
    let id = cell.split('/').nth(1)?.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Key id from the packet listing gpg prints when fed a bare key.
///
/// The second whitespace-separated field is `<size><algo>/<id>`.
#[must_use]
pub fn packet_key_id(output: &str) -> Option<String> {
    let field = output.split_whitespace().nth(1)?;
    let id = field.split('/').nth(1)?;
    (!id.is_empty()).then(|| id.to_string())
}

/// Whether a `--status-fd` stream reports a good, valid signature and no
/// bad or unverifiable one.
#[must_use]
pub fn signature_is_valid(status: &str) -> bool {
    let mut good = false;
    let mut valid = false;
    for line in status.lines() {
        let Some(rest) = line.strip_prefix("[GNUPG:] ") else {
            continue;
        };
        let keyword = rest.split_whitespace().next().unwrap_or_default();
        match keyword {
            "GOODSIG" => good = true,
            "VALIDSIG" => valid = true,
            "BADSIG" | "ERRSIG" | "EXPSIG" | "EXPKEYSIG" | "REVKEYSIG" | "NODATA" => return false,
            _ => {},
        }
    }
    good && valid
}
