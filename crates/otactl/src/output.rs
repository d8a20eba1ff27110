//! Output formatting: JSON on request, one readable line per result otherwise

use anyhow::Result;
use otakit::Bundle;
use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub struct Printer {
    pub json: bool,
}

impl Printer {
    pub fn emit<T, F>(&self, value: &T, human: F) -> Result<()>
    where
        T: Serialize,
        F: FnOnce(&T) -> String,
    {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", human(value));
        }
        Ok(())
    }

    pub fn ok(&self, message: &str) -> Result<()> {
        self.emit(&serde_json::json!({ "ok": true }), |_| message.to_string())
    }
}

pub fn bundle_line(bundle: &Bundle) -> String {
    if bundle.is_builtin() {
        return "builtin".to_string();
    }
    format!(
        "{}  {:<12} {:<11} {}",
        bundle.id,
        bundle.version,
        bundle.status,
        bundle.downloaded.format("%Y-%m-%d %H:%M:%S")
    )
}

pub fn bundle_table(bundles: &[Bundle]) -> String {
    if bundles.is_empty() {
        return "No downloaded bundles".to_string();
    }
    bundles.iter().map(bundle_line).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use otakit::BundleStatus;

    #[test]
    fn test_builtin_line() {
        assert_eq!(bundle_line(&Bundle::builtin()), "builtin");
    }

    #[test]
    fn test_bundle_line_has_version_and_status() {
        let mut bundle = Bundle::new("1.2.0", chrono::Utc::now());
        bundle.status = BundleStatus::Success;
        let line = bundle_line(&bundle);
        assert!(line.starts_with(bundle.id.as_str()));
        assert!(line.contains("1.2.0"));
        assert!(line.contains("success"));
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(bundle_table(&[]), "No downloaded bundles");
    }
}
