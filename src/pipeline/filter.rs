//! Allow-list filters.

use std::borrow::Cow;
use std::collections::HashSet;

use super::Filterer;
use crate::models::{Event, ExportFilter};

/// Accepts events whose device is in the allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdFilter {
    devices: HashSet<String>,
}

impl DeviceIdFilter {
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
        }
    }
}

impl Filterer for DeviceIdFilter {
    fn filter<'a>(&self, event: Cow<'a, Event>) -> Option<Cow<'a, Event>> {
        self.devices.contains(&event.device).then_some(event)
    }
}

/// Keeps only readings whose value descriptor is in the allow-list.
///
/// Rejects the event when no reading survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDescriptorFilter {
    names: HashSet<String>,
}

impl ValueDescriptorFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl Filterer for ValueDescriptorFilter {
    fn filter<'a>(&self, event: Cow<'a, Event>) -> Option<Cow<'a, Event>> {
        let kept = event
            .readings
            .iter()
            .filter(|r| self.names.contains(&r.name))
            .count();

        if kept == 0 {
            return None;
        }
        if kept == event.readings.len() {
            return Some(event);
        }

        let mut narrowed = event.into_owned();
        narrowed.readings.retain(|r| self.names.contains(&r.name));
        Some(Cow::Owned(narrowed))
    }
}

/// Filter stage resolved from a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    DeviceId(DeviceIdFilter),
    ValueDescriptor(ValueDescriptorFilter),
}

impl Filter {
    /// Build the filter chain for a registration.
    ///
    /// Empty allow-lists install no filter. The device filter runs first.
    pub fn chain(filter: &ExportFilter) -> Vec<Filter> {
        let mut chain = Vec::with_capacity(2);
        if !filter.device_identifiers.is_empty() {
            chain.push(Filter::DeviceId(DeviceIdFilter::new(
                filter.device_identifiers.iter().cloned(),
            )));
        }
        if !filter.value_descriptor_identifiers.is_empty() {
            chain.push(Filter::ValueDescriptor(ValueDescriptorFilter::new(
                filter.value_descriptor_identifiers.iter().cloned(),
            )));
        }
        chain
    }
}

impl Filterer for Filter {
    fn filter<'a>(&self, event: Cow<'a, Event>) -> Option<Cow<'a, Event>> {
        match self {
            Filter::DeviceId(f) => f.filter(event),
            Filter::ValueDescriptor(f) => f.filter(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reading;

    fn event(device: &str, names: &[&str]) -> Event {
        Event::new(
            device,
            names.iter().map(|n| Reading::new(*n, "1")).collect(),
        )
    }

    #[test]
    fn test_device_filter_accepts_listed_device() {
        let filter = DeviceIdFilter::new(["dev-1"]);
        let e = event("dev-1", &["temp"]);
        assert!(filter.filter(Cow::Borrowed(&e)).is_some());
    }

    #[test]
    fn test_device_filter_rejects_other_device() {
        let filter = DeviceIdFilter::new(["dev-1"]);
        let e = event("dev-2", &["temp"]);
        assert!(filter.filter(Cow::Borrowed(&e)).is_none());
    }

    #[test]
    fn test_value_filter_narrows_readings() {
        let filter = ValueDescriptorFilter::new(["temp"]);
        let e = event("dev-1", &["temp", "humidity"]);

        let out = filter.filter(Cow::Borrowed(&e)).unwrap();
        assert!(matches!(out, Cow::Owned(_)));
        assert_eq!(out.readings.len(), 1);
        assert_eq!(out.readings[0].name, "temp");
        // source event untouched
        assert_eq!(e.readings.len(), 2);
    }

    #[test]
    fn test_value_filter_borrows_when_nothing_removed() {
        let filter = ValueDescriptorFilter::new(["temp", "humidity"]);
        let e = event("dev-1", &["temp", "humidity"]);
        assert!(matches!(
            filter.filter(Cow::Borrowed(&e)),
            Some(Cow::Borrowed(_))
        ));
    }

    #[test]
    fn test_value_filter_rejects_when_no_reading_matches() {
        let filter = ValueDescriptorFilter::new(["pressure"]);
        let e = event("dev-1", &["temp"]);
        assert!(filter.filter(Cow::Borrowed(&e)).is_none());
    }

    #[test]
    fn test_chain_skips_empty_lists() {
        assert!(Filter::chain(&ExportFilter::default()).is_empty());

        let chain = Filter::chain(&ExportFilter {
            device_identifiers: vec!["dev-1".to_string()],
            value_descriptor_identifiers: vec!["temp".to_string()],
        });
        assert_eq!(chain.len(), 2);
        assert!(matches!(chain[0], Filter::DeviceId(_)));
        assert!(matches!(chain[1], Filter::ValueDescriptor(_)));
    }
}
