use crate::domain::FieldValue;
use crate::error::{BidError, Result};
use crate::external::ExternalSeries;
use crate::timeseries::history::HistoricalRow;
use chrono::Datelike;
use std::collections::BTreeMap;

pub fn rolling_mean_column(group: &str, window: usize, target: &str) -> String {
    format!("{group}_rolling_{window}d_mean_{target}")
}

pub fn rolling_winrate_column(group: &str, window: usize) -> String {
    format!("{group}_rolling_{window}d_winrate")
}

pub fn lag_column(group: &str, lag: usize, column: &str) -> String {
    format!("{group}_lag_{lag}_{column}")
}

/// Trailing mean over the last `window` entries (current one included). Undefined
/// entries are skipped; the mean is undefined only when the whole window is.
pub fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let (sum, n) = values[start..=i]
                .iter()
                .flatten()
                .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            (n > 0).then(|| sum / n as f64)
        })
        .collect()
}

/// Value `lag` positions earlier; the first `lag` entries are undefined.
pub fn lagged(values: &[Option<f64>], lag: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| i.checked_sub(lag).and_then(|j| values[j]))
        .collect()
}

/// Enriches historical bids with calendar, per-group rolling and lag features and
/// asof-joined external covariates.
#[derive(Debug, Clone)]
pub struct TimeSeriesFeatureBuilder {
    pub group_keys: Vec<String>,
    pub target_columns: Vec<String>,
    pub windows: Vec<usize>,
    pub lag_steps: Vec<usize>,
    /// Binary outcome column; adds rolling win rates and is lagged with the targets.
    pub win_column: Option<String>,
}

impl Default for TimeSeriesFeatureBuilder {
    fn default() -> Self {
        Self {
            group_keys: vec!["ClientType".to_string(), "Location".to_string()],
            target_columns: vec!["BidAmount".to_string()],
            windows: vec![7, 30, 90],
            lag_steps: vec![1, 2],
            win_column: Some("WinStatus".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedDataset {
    /// Ascending by event date.
    pub rows: Vec<HistoricalRow>,
    pub added_columns: Vec<String>,
}

impl TimeSeriesFeatureBuilder {
    fn validate(&self) -> Result<()> {
        if self.windows.contains(&0) {
            return Err(BidError::Config("rolling windows must be >= 1".into()));
        }
        if self.lag_steps.contains(&0) {
            return Err(BidError::Config("lag steps must be >= 1".into()));
        }
        Ok(())
    }

    pub fn build(
        &self,
        mut rows: Vec<HistoricalRow>,
        external: &[ExternalSeries],
    ) -> Result<EnrichedDataset> {
        self.validate()?;

        rows.sort_by_key(|r| r.event_date);
        let mut added = Vec::new();

        add_calendar_features(&mut rows, &mut added);

        let present = |col: &str| rows.iter().any(|r| r.has_column(col));
        let groups: Vec<&String> = self.group_keys.iter().filter(|g| present(g)).collect();
        let targets: Vec<&String> = self
            .target_columns
            .iter()
            .filter(|c| present(c))
            .collect();
        let win_column = self.win_column.as_ref().filter(|c| present(c));

        for missing in self.target_columns.iter().filter(|c| !present(c)) {
            tracing::warn!(column = %missing, "target column absent from history; skipped");
        }

        let mut lag_columns = targets.clone();
        lag_columns.extend(win_column);

        for group in groups {
            let members = group_members(&rows, group);

            for &window in &self.windows {
                for target in &targets {
                    let name = rolling_mean_column(group, window, target);
                    assign_per_group(&mut rows, &members, &name, target, |v| {
                        rolling_mean(v, window)
                    });
                    added.push(name);
                }
                if let Some(win) = win_column {
                    let name = rolling_winrate_column(group, window);
                    assign_per_group(&mut rows, &members, &name, win, |v| rolling_mean(v, window));
                    added.push(name);
                }
            }

            for &lag in &self.lag_steps {
                for column in &lag_columns {
                    let name = lag_column(group, lag, column);
                    assign_per_group(&mut rows, &members, &name, column, |v| lagged(v, lag));
                    added.push(name);
                }
            }
        }

        merge_external(&mut rows, external, &mut added);

        tracing::debug!(
            rows = rows.len(),
            added_columns = added.len(),
            "history enriched"
        );

        Ok(EnrichedDataset {
            rows,
            added_columns: added,
        })
    }
}

fn add_calendar_features(rows: &mut [HistoricalRow], added: &mut Vec<String>) {
    for row in rows.iter_mut() {
        let d = row.event_date;
        row.set("Year", d.year() as f64);
        row.set("Month", d.month() as f64);
        row.set("DayOfWeek", d.weekday().num_days_from_monday() as f64);
        row.set("Quarter", ((d.month() - 1) / 3 + 1) as f64);
        row.set("Week", d.iso_week().week() as f64);
    }
    added.extend(
        ["Year", "Month", "DayOfWeek", "Quarter", "Week"]
            .into_iter()
            .map(String::from),
    );
}

/// Row indices per group value, in row order. Rows with a null or absent key belong to
/// no group.
fn group_members(rows: &[HistoricalRow], key: &str) -> BTreeMap<String, Vec<usize>> {
    let mut out: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, row) in rows.iter().enumerate() {
        if let Some(category) = row.get(key).and_then(FieldValue::category) {
            out.entry(category).or_default().push(idx);
        }
    }
    out
}

fn assign_per_group(
    rows: &mut [HistoricalRow],
    members: &BTreeMap<String, Vec<usize>>,
    name: &str,
    source: &str,
    derive: impl Fn(&[Option<f64>]) -> Vec<Option<f64>>,
) {
    for row in rows.iter_mut() {
        row.set(name, FieldValue::Null);
    }
    for idxs in members.values() {
        let values: Vec<Option<f64>> = idxs.iter().map(|&i| rows[i].number(source)).collect();
        for (&i, v) in idxs.iter().zip(derive(&values)) {
            rows[i].set(name, v);
        }
    }
}

fn merge_external(
    rows: &mut [HistoricalRow],
    external: &[ExternalSeries],
    added: &mut Vec<String>,
) {
    if external.is_empty() {
        tracing::info!("no external series available; skipping covariate merge");
        return;
    }
    for series in external {
        if series.is_empty() {
            tracing::warn!(series_id = %series.series_id, "external series is empty; skipped");
            continue;
        }
        for row in rows.iter_mut() {
            row.set(series.series_id.clone(), series.value_asof(row.event_date));
        }
        added.push(series.series_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::Observation;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn builder() -> TimeSeriesFeatureBuilder {
        TimeSeriesFeatureBuilder {
            group_keys: vec!["Location".to_string()],
            target_columns: vec!["BidAmount".to_string()],
            windows: vec![2],
            lag_steps: vec![1],
            win_column: None,
        }
    }

    fn column(ds: &EnrichedDataset, name: &str) -> Vec<Option<f64>> {
        ds.rows.iter().map(|r| r.number(name)).collect()
    }

    #[test]
    fn rolling_mean_is_causal() {
        let v = [Some(10.0), Some(20.0), Some(30.0)];
        assert_eq!(rolling_mean(&v, 2), vec![Some(10.0), Some(15.0), Some(25.0)]);
        assert_eq!(rolling_mean(&v, 1), v.to_vec());
    }

    #[test]
    fn rolling_mean_skips_gaps() {
        let v = [None, Some(4.0), None, None];
        assert_eq!(rolling_mean(&v, 2), vec![None, Some(4.0), Some(4.0), None]);
    }

    #[test]
    fn lag_leaves_first_rows_undefined() {
        let v = [Some(10.0), Some(20.0), Some(30.0)];
        assert_eq!(lagged(&v, 1), vec![None, Some(10.0), Some(20.0)]);
        assert_eq!(lagged(&v, 3), vec![None, None, None]);
    }

    #[test]
    fn groups_are_computed_independently_in_date_order() {
        let rows = vec![
            HistoricalRow::new(d(2023, 1, 3)).with("Location", "NY").with("BidAmount", 30.0),
            HistoricalRow::new(d(2023, 1, 1)).with("Location", "NY").with("BidAmount", 10.0),
            HistoricalRow::new(d(2023, 1, 2)).with("Location", "LA").with("BidAmount", 99.0),
            HistoricalRow::new(d(2023, 1, 2)).with("Location", "NY").with("BidAmount", 20.0),
        ];

        let ds = builder().build(rows, &[]).unwrap();
        assert_eq!(ds.rows.len(), 4);
        assert!(ds.rows.windows(2).all(|w| w[0].event_date <= w[1].event_date));

        // Sorted: NY 10, LA 99, NY 20, NY 30.
        assert_eq!(
            column(&ds, "Location_rolling_2d_mean_BidAmount"),
            vec![Some(10.0), Some(99.0), Some(15.0), Some(25.0)]
        );
        assert_eq!(
            column(&ds, "Location_lag_1_BidAmount"),
            vec![None, None, Some(10.0), Some(20.0)]
        );
    }

    #[test]
    fn null_group_key_gets_undefined_features() {
        let rows = vec![
            HistoricalRow::new(d(2023, 1, 1)).with("Location", "NY").with("BidAmount", 10.0),
            HistoricalRow::new(d(2023, 1, 2))
                .with("Location", FieldValue::Null)
                .with("BidAmount", 5.0),
        ];
        let ds = builder().build(rows, &[]).unwrap();
        assert_eq!(column(&ds, "Location_rolling_2d_mean_BidAmount"), vec![Some(10.0), None]);
    }

    #[test]
    fn calendar_features() {
        // 2023-01-15 is a Sunday in ISO week 2.
        let rows = vec![HistoricalRow::new(d(2023, 1, 15)).with("Location", "NY")];
        let ds = builder().build(rows, &[]).unwrap();
        let r = &ds.rows[0];
        assert_eq!(r.number("Year"), Some(2023.0));
        assert_eq!(r.number("Month"), Some(1.0));
        assert_eq!(r.number("DayOfWeek"), Some(6.0));
        assert_eq!(r.number("Quarter"), Some(1.0));
        assert_eq!(r.number("Week"), Some(2.0));
    }

    #[test]
    fn external_series_is_asof_merged() {
        let unrate = ExternalSeries::new(
            "UNRATE",
            vec![
                Observation {
                    date: d(2023, 1, 1),
                    value: 5.0,
                },
                Observation {
                    date: d(2023, 2, 1),
                    value: 6.0,
                },
            ],
        );
        let rows = vec![
            HistoricalRow::new(d(2023, 1, 15)).with("BidAmount", 1.0),
            HistoricalRow::new(d(2022, 12, 1)).with("BidAmount", 2.0),
        ];

        let ds = builder().build(rows, &[unrate]).unwrap();
        assert_eq!(column(&ds, "UNRATE"), vec![None, Some(5.0)]);
        assert!(ds.added_columns.contains(&"UNRATE".to_string()));
    }

    #[test]
    fn several_series_merge_independently_and_empty_ones_are_skipped() {
        let obs = |date, value| Observation { date, value };
        let monthly = ExternalSeries::new(
            "UNRATE",
            vec![obs(d(2023, 1, 1), 3.4), obs(d(2023, 2, 1), 3.6)],
        );
        let weekly = ExternalSeries::new(
            "ICSA",
            vec![
                obs(d(2023, 1, 7), 200.0),
                obs(d(2023, 1, 14), 210.0),
                obs(d(2023, 1, 21), 190.0),
                obs(d(2023, 2, 4), 220.0),
            ],
        );
        let empty = ExternalSeries::new("CPIAUCSL", Vec::new());
        let rows = vec![
            HistoricalRow::new(d(2023, 1, 5)).with("BidAmount", 1.0),
            HistoricalRow::new(d(2023, 1, 14)).with("BidAmount", 2.0),
            HistoricalRow::new(d(2023, 2, 2)).with("BidAmount", 3.0),
        ];

        let ds = builder().build(rows, &[monthly, empty, weekly]).unwrap();

        assert_eq!(column(&ds, "UNRATE"), vec![Some(3.4), Some(3.4), Some(3.6)]);
        assert_eq!(column(&ds, "ICSA"), vec![None, Some(210.0), Some(190.0)]);
        assert!(ds.rows.iter().all(|r| !r.has_column("CPIAUCSL")));

        let external: Vec<&str> = ds
            .added_columns
            .iter()
            .map(String::as_str)
            .filter(|c| ["UNRATE", "ICSA", "CPIAUCSL"].contains(c))
            .collect();
        assert_eq!(external, vec!["UNRATE", "ICSA"]);
    }

    #[test]
    fn missing_external_series_is_not_fatal() {
        let rows = vec![HistoricalRow::new(d(2023, 1, 15)).with("Location", "NY")];
        let ds = builder().build(rows, &[]).unwrap();
        assert!(ds.rows[0].get("UNRATE").is_none());
    }

    #[test]
    fn win_column_adds_winrate_and_lag() {
        let b = TimeSeriesFeatureBuilder {
            win_column: Some("WinStatus".to_string()),
            ..builder()
        };
        let rows = vec![
            HistoricalRow::new(d(2023, 1, 1))
                .with("Location", "NY")
                .with("BidAmount", 1.0)
                .with("WinStatus", 1.0),
            HistoricalRow::new(d(2023, 1, 2))
                .with("Location", "NY")
                .with("BidAmount", 1.0)
                .with("WinStatus", 0.0),
        ];
        let ds = b.build(rows, &[]).unwrap();
        assert_eq!(column(&ds, "Location_rolling_2d_winrate"), vec![Some(1.0), Some(0.5)]);
        assert_eq!(column(&ds, "Location_lag_1_WinStatus"), vec![None, Some(1.0)]);
    }

    #[test]
    fn zero_window_is_rejected() {
        let b = TimeSeriesFeatureBuilder {
            windows: vec![0],
            ..builder()
        };
        assert!(matches!(b.build(Vec::new(), &[]), Err(BidError::Config(_))));
    }
}
