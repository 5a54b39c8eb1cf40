//! Smallworld environment discovery: `gis_aliases` and `LAYERED_PRODUCTS`.
//!
//! Both files share one shape: a `name:` line opens a stanza and the lines
//! below it are `key = value` pairs until the next stanza. Values may end in
//! a `\` continuation marker and may reference `%SMALLWORLD_GIS%`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::transport::ProcessCommand;

const GIS_PLACEHOLDER: &str = "%SMALLWORLD_GIS%";
const CORE_PRODUCT: &str = "sw_core";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stanza {
    pub name: String,
    pub entries: BTreeMap<String, String>,
}

impl Stanza {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

/// Parses stanza-shaped text. Comment lines (`#`) and blank lines are
/// skipped; pairs that appear before the first stanza name are ignored.
pub fn parse_stanzas(text: &str, gis_path: &Path) -> Vec<Stanza> {
    let gis = gis_path.to_string_lossy();
    let mut stanzas: Vec<Stanza> = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = stanza_name(line) {
            stanzas.push(Stanza {
                name: name.to_string(),
                entries: BTreeMap::new(),
            });
            continue;
        }
        let Some(current) = stanzas.last_mut() else {
            continue;
        };
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, ""),
        };
        let value = value.strip_suffix('\\').unwrap_or(value).trim_end();
        current
            .entries
            .insert(key.to_string(), value.replace(GIS_PLACEHOLDER, &gis));
    }

    stanzas
}

fn stanza_name(line: &str) -> Option<&str> {
    let name = line.strip_suffix(':')?;
    let valid = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    valid.then_some(name)
}

pub fn parse_gis_aliases(text: &str, gis_path: &Path) -> Vec<Stanza> {
    parse_stanzas(text, gis_path)
}

/// Parses `LAYERED_PRODUCTS`. The core product is registered by its
/// `sw_core` subdirectory, so its path is cut back to the product root.
pub fn parse_layered_products(text: &str, gis_path: &Path) -> Vec<Stanza> {
    let mut products = parse_stanzas(text, gis_path);
    for product in products.iter_mut().filter(|p| p.name == CORE_PRODUCT) {
        if let Some(path) = product.entries.get_mut("path") {
            let cut = path.len().saturating_sub(CORE_PRODUCT.len() + 1);
            if path.is_char_boundary(cut) {
                path.truncate(cut);
            }
        }
    }
    products
}

pub fn read_gis_aliases(path: &Path, gis_path: &Path) -> Result<Vec<Stanza>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read gis_aliases: {}", path.display()))?;
    Ok(parse_gis_aliases(&text, gis_path))
}

pub fn read_layered_products(gis_path: &Path) -> Result<Vec<Stanza>> {
    let path = layered_products_path(gis_path);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read LAYERED_PRODUCTS: {}", path.display()))?;
    Ok(parse_layered_products(&text, gis_path))
}

pub fn layered_products_path(gis_path: &Path) -> PathBuf {
    gis_path
        .join("..")
        .join("smallworld_registry")
        .join("LAYERED_PRODUCTS")
}

/// `gis_aliases` shipped with a layered product.
pub fn product_aliases_path(product_path: &Path) -> PathBuf {
    product_path.join("config").join("gis_aliases")
}

pub fn runalias_path(gis_path: &Path) -> PathBuf {
    gis_path.join("bin").join("x86").join("runalias.exe")
}

/// Command line that starts a session for `alias`.
pub fn runalias_command(
    gis_path: &Path,
    aliases_file: &Path,
    alias: &str,
    environment: Option<&Path>,
) -> ProcessCommand {
    let mut command = ProcessCommand::new(runalias_path(gis_path))
        .arg("-a")
        .arg(aliases_file.to_string_lossy());
    if let Some(env) = environment {
        command = command.arg("-e").arg(env.to_string_lossy());
    }
    command.arg(alias)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIS_ALIASES: &str = "\
# Smallworld aliases
swaf:
\ttitle    = Smallworld Core
\tsession  = swaf.gis_session\\
\tproduct  = %SMALLWORLD_GIS%\\sw_core

# Cambridge demo
cambridge_db_open:
\ttitle = Cambridge
\tsession = sw_cambridge:cambridge_db_open
";

    #[test]
    fn parses_alias_stanzas() {
        let aliases = parse_gis_aliases(GIS_ALIASES, Path::new("C:\\sw\\core"));
        assert_eq!(aliases.len(), 2);

        assert_eq!(aliases[0].name, "swaf");
        assert_eq!(aliases[0].get("title"), Some("Smallworld Core"));
        assert_eq!(aliases[0].get("session"), Some("swaf.gis_session"));
        assert_eq!(aliases[0].get("product"), Some("C:\\sw\\core\\sw_core"));

        assert_eq!(aliases[1].name, "cambridge_db_open");
        assert_eq!(
            aliases[1].get("session"),
            Some("sw_cambridge:cambridge_db_open")
        );
    }

    #[test]
    fn core_product_path_points_at_product_root() {
        let text = "\
sw_core:
\tpath = %SMALLWORLD_GIS%\\sw_core
\tversion = 5.3
cambridge:
\tpath = C:\\products\\cambridge
";
        let products = parse_layered_products(text, Path::new("C:\\sw\\core"));
        assert_eq!(products[0].get("path"), Some("C:\\sw\\core"));
        assert_eq!(products[0].get("version"), Some("5.3"));
        assert_eq!(products[1].get("path"), Some("C:\\products\\cambridge"));
    }

    #[test]
    fn values_may_contain_equals_and_keys_may_stand_alone() {
        let aliases = parse_stanzas("a:\n args = -Dx=1\n flag\n", Path::new("/gis"));
        assert_eq!(aliases[0].get("args"), Some("-Dx=1"));
        assert_eq!(aliases[0].get("flag"), Some(""));
    }

    #[test]
    fn runalias_command_line() {
        let command = runalias_command(
            Path::new("/gis"),
            Path::new("/gis/config/gis_aliases"),
            "swaf",
            Some(Path::new("/gis/config/environment.bat")),
        );
        assert_eq!(command.program, PathBuf::from("/gis/bin/x86/runalias.exe"));
        assert_eq!(
            command.args,
            vec![
                "-a",
                "/gis/config/gis_aliases",
                "-e",
                "/gis/config/environment.bat",
                "swaf"
            ]
        );

        let command = runalias_command(Path::new("/gis"), Path::new("aliases"), "swaf", None);
        assert_eq!(command.args, vec!["-a", "aliases", "swaf"]);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_gis_aliases(Path::new("/no/such/gis_aliases"), Path::new("/gis"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("/no/such/gis_aliases"));
    }
}
