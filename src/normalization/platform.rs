/// Canonical platform label shared across services.
///
/// Services spell the same hardware differently (`PS5`, `XboxSeries`, `Genesis/Mega Drive`).
/// Known spellings are folded onto one label; anything else is kept trimmed as reported.
pub fn canonical_platform(raw: &str) -> String {
    let trimmed = raw.trim();
    let key: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();

    let label = match key.as_str() {
        "ps3" | "playstation3" => "PS3",
        "ps4" | "playstation4" => "PS4",
        "ps5" | "playstation5" => "PS5",
        "psvita" | "vita" | "playstationvita" => "PS Vita",
        "xbox360" => "Xbox 360",
        "xboxone" | "durango" => "Xbox One",
        "xboxseries" | "xboxseriesxs" | "scarlett" => "Xbox Series X|S",
        "pc" | "win32" | "windows" => "PC",
        "genesismegadrive" | "megadrive" | "genesis" => "Genesis/Mega Drive",
        "snessuperfamicom" | "snes" | "superfamicom" => "SNES/Super Famicom",
        "nes" | "nesfamicom" | "famicom" => "NES/Famicom",
        "playstation" | "ps1" | "psx" => "PlayStation",
        _ => return trimmed.to_string(),
    };
    label.to_string()
}

/// Split a comma separated platform list (PSN reports `"PS4,PSVITA"`), folding each entry.
pub fn split_platforms(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in raw.split(',') {
        if part.trim().is_empty() {
            continue;
        }
        let label = canonical_platform(part);
        if !out.contains(&label) {
            out.push(label);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_service_spellings() {
        assert_eq!(canonical_platform("PS5"), "PS5");
        assert_eq!(canonical_platform("PlayStation 5"), "PS5");
        assert_eq!(canonical_platform("XboxSeries"), "Xbox Series X|S");
        assert_eq!(canonical_platform("Genesis/Mega Drive"), "Genesis/Mega Drive");
        assert_eq!(canonical_platform(" Arcade "), "Arcade");
    }

    #[test]
    fn splits_and_dedupes_lists() {
        assert_eq!(split_platforms("PS4,PSVITA"), vec!["PS4", "PS Vita"]);
        assert_eq!(split_platforms("PS5, PS5,"), vec!["PS5"]);
    }
}
