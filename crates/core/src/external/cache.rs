use crate::external::ExternalSeries;
use anyhow::Context;
use std::path::Path;

/// Cached series, or `None` when nothing has been cached yet.
pub fn load_cached(path: &Path) -> anyhow::Result<Option<Vec<ExternalSeries>>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read series cache {}", path.display()))?;
    let series = serde_json::from_str::<Vec<ExternalSeries>>(&text)
        .with_context(|| format!("series cache {} is corrupt", path.display()))?;
    Ok(Some(series))
}

pub fn save_cached(path: &Path, series: &[ExternalSeries]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(series).context("serialize series cache failed")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write series cache {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::Observation;
    use chrono::NaiveDate;

    #[test]
    fn absent_cache_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_cached(&dir.path().join("fred.json")).unwrap().is_none());
    }

    #[test]
    fn saved_cache_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/fred_cached.json");
        let series = vec![ExternalSeries::new(
            "UNRATE",
            vec![Observation {
                date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
                value: 3.4,
            }],
        )];

        save_cached(&path, &series).unwrap();
        assert_eq!(load_cached(&path).unwrap(), Some(series));
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fred.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_cached(&path).is_err());
    }
}
