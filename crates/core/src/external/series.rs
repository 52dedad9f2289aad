use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub value: f64,
}

/// Low-frequency dated series (e.g. a monthly unemployment rate) joined into the
/// historical dataset by nearest preceding date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSeries {
    pub series_id: String,
    observations: Vec<Observation>,
}

impl ExternalSeries {
    /// Non-finite values are dropped; observations are kept in ascending date order.
    pub fn new(series_id: impl Into<String>, observations: Vec<Observation>) -> Self {
        let mut observations: Vec<Observation> = observations
            .into_iter()
            .filter(|o| o.value.is_finite())
            .collect();
        observations.sort_by_key(|o| o.date);
        Self {
            series_id: series_id.into(),
            observations,
        }
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Latest observation dated on or before `date`; `None` before the first one.
    /// With duplicate dates the last observation wins.
    pub fn value_asof(&self, date: NaiveDate) -> Option<f64> {
        let idx = self.observations.partition_point(|o| o.date <= date);
        idx.checked_sub(1).map(|i| self.observations[i].value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn series() -> ExternalSeries {
        ExternalSeries::new(
            "UNRATE",
            vec![
                Observation {
                    date: d(2023, 2, 1),
                    value: 6.0,
                },
                Observation {
                    date: d(2023, 1, 1),
                    value: 5.0,
                },
                Observation {
                    date: d(2023, 3, 1),
                    value: f64::NAN,
                },
            ],
        )
    }

    #[test]
    fn asof_picks_nearest_preceding_observation() {
        let s = series();
        assert_eq!(s.len(), 2);
        assert_eq!(s.value_asof(d(2023, 1, 15)), Some(5.0));
        assert_eq!(s.value_asof(d(2023, 2, 1)), Some(6.0));
        assert_eq!(s.value_asof(d(2023, 6, 1)), Some(6.0));
        assert_eq!(s.value_asof(d(2022, 12, 1)), None);
    }
}
