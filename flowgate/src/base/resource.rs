use std::fmt;

/// Classification of a resource, reported in the metric log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResourceType {
    #[default]
    Common = 0,
    Web = 1,
    Rpc = 2,
    ApiGateway = 3,
    DbSql = 4,
    Cache = 5,
    Mq = 6,
}

/// Direction of the traffic guarded by an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TrafficType {
    Inbound,
    #[default]
    Outbound,
}

/// Identity of a guarded resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceWrapper {
    name: String,
    classification: ResourceType,
    flow_type: TrafficType,
}

impl ResourceWrapper {
    pub fn new(name: impl Into<String>, classification: ResourceType, flow_type: TrafficType) -> Self {
        Self {
            name: name.into(),
            classification,
            flow_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classification(&self) -> ResourceType {
        self.classification
    }

    pub fn flow_type(&self) -> TrafficType {
        self.flow_type
    }
}

impl fmt::Display for ResourceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResourceWrapper{{name={}, flowType={:?}, classification={:?}}}",
            self.name, self.flow_type, self.classification
        )
    }
}
