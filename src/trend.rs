use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Aggregation window of an externally fetched trend series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendKind {
    Day,
    Week,
    Month,
}

impl TrendKind {
    pub const ALL: [TrendKind; 3] = [TrendKind::Day, TrendKind::Week, TrendKind::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendKind::Day => "day",
            TrendKind::Week => "week",
            TrendKind::Month => "month",
        }
    }
}

impl fmt::Display for TrendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(TrendKind::Day),
            "week" => Ok(TrendKind::Week),
            "month" => Ok(TrendKind::Month),
            other => Err(format!("unknown trend kind: {}", other)),
        }
    }
}

/// Opaque aggregate payloads, one slot per [`TrendKind`]. Contents are never inspected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendCache {
    #[serde(default)]
    day: Option<Value>,
    #[serde(default)]
    week: Option<Value>,
    #[serde(default)]
    month: Option<Value>,
}

impl TrendCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_trend(&mut self, kind: TrendKind, data: Value) {
        *self.slot_mut(kind) = Some(data);
    }

    pub fn get(&self, kind: TrendKind) -> Option<&Value> {
        match kind {
            TrendKind::Day => self.day.as_ref(),
            TrendKind::Week => self.week.as_ref(),
            TrendKind::Month => self.month.as_ref(),
        }
    }

    pub fn clear_trends(&mut self) {
        self.day = None;
        self.week = None;
        self.month = None;
    }

    pub fn is_empty(&self) -> bool {
        TrendKind::ALL.iter().all(|kind| self.get(*kind).is_none())
    }

    fn slot_mut(&mut self, kind: TrendKind) -> &mut Option<Value> {
        match kind {
            TrendKind::Day => &mut self.day,
            TrendKind::Week => &mut self.week,
            TrendKind::Month => &mut self.month,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_overwrites_only_its_slot() {
        let mut trends = TrendCache::new();
        trends.save_trend(TrendKind::Day, json!({ "hours": [1, 2] }));
        trends.save_trend(TrendKind::Week, json!([3]));
        trends.save_trend(TrendKind::Day, json!("replaced"));

        assert_eq!(trends.get(TrendKind::Day), Some(&json!("replaced")));
        assert_eq!(trends.get(TrendKind::Week), Some(&json!([3])));
        assert_eq!(trends.get(TrendKind::Month), None);
    }

    #[test]
    fn test_clear_trends_empties_all_slots() {
        let mut trends = TrendCache::new();
        for kind in TrendKind::ALL {
            trends.save_trend(kind, json!(1));
        }

        trends.clear_trends();
        assert!(trends.is_empty());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Week".parse::<TrendKind>(), Ok(TrendKind::Week));
        assert!("year".parse::<TrendKind>().is_err());
        assert_eq!(TrendKind::Month.to_string(), "month");
    }
}
