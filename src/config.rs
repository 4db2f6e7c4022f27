use crate::core::{DbError, Result};
use crate::dialect::{DialectKind, DialectPolicies};
use serde::{Deserialize, Serialize};

/// Transaction manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Join a database into the current transaction on first use instead of
    /// failing with `DATABASE_NOT_PART_OF_TRANSACTION`.
    pub auto_join: bool,
    /// Client id stamped on every entity change event.
    pub source_client_id: String,
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_join(mut self, auto_join: bool) -> Self {
        self.auto_join = auto_join;
        self
    }

    pub fn source_client_id(mut self, client_id: &str) -> Self {
        self.source_client_id = client_id.to_string();
        self
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            auto_join: true,
            source_client_id: "unifydb".to_string(),
        }
    }
}

/// Data source configuration
///
/// Loaded from JSON or from a connection string such as
/// `unifydb://inventory?max_connections=4&dialect=ansi`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    /// Data source name
    pub name: String,

    /// SQL dialect used to render statements
    pub dialect: DialectKind,

    /// Maximum number of concurrently open sessions
    pub max_connections: usize,

    /// Maximum values in one IN list before chunking
    pub max_clause_values: usize,

    /// Row limit applied to queries flagged for the application limit
    pub app_query_limit: Option<i32>,

    /// Upper-case identifiers in native queries
    pub all_upper_case: bool,
}

impl DataSourceConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn dialect(mut self, dialect: DialectKind) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn max_clause_values(mut self, max: usize) -> Self {
        self.max_clause_values = max;
        self
    }

    pub fn app_query_limit(mut self, limit: i32) -> Self {
        self.app_query_limit = Some(limit);
        self
    }

    pub fn all_upper_case(mut self, upper: bool) -> Self {
        self.all_upper_case = upper;
        self
    }

    /// Dialect policies derived from this configuration.
    pub fn policies(&self) -> DialectPolicies {
        DialectPolicies {
            max_clause_values: self.max_clause_values,
            all_upper_case: self.all_upper_case,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from connection string
    ///
    /// Format: `unifydb://name?key=value&key=value`
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("unifydb://")
            .ok_or_else(|| DbError::ConfigError("URL must start with 'unifydb://'".into()))?;

        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };

        let mut config = Self::new(name);
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| DbError::ConfigError(format!("Invalid URL parameter '{}'", pair)))?;
            match key {
                "dialect" => config.dialect = value.parse()?,
                "max_connections" => config.max_connections = parse_number(key, value)?,
                "max_clause_values" => config.max_clause_values = parse_number(key, value)?,
                "app_query_limit" => config.app_query_limit = Some(parse_number(key, value)?),
                "all_upper_case" => config.all_upper_case = parse_number(key, value)?,
                other => {
                    return Err(DbError::ConfigError(format!(
                        "Unknown URL parameter '{}'",
                        other
                    )));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn to_url(&self) -> String {
        let mut url = format!(
            "unifydb://{}?max_connections={}&max_clause_values={}",
            self.name, self.max_connections, self.max_clause_values
        );
        if let Some(limit) = self.app_query_limit {
            url.push_str(&format!("&app_query_limit={}", limit));
        }
        if self.all_upper_case {
            url.push_str("&all_upper_case=true");
        }
        url
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DbError::ConfigError("Data source name cannot be empty".into()));
        }

        if self.max_connections == 0 {
            return Err(DbError::ConfigError("max_connections must be > 0".into()));
        }

        if matches!(self.app_query_limit, Some(limit) if limit <= 0) {
            return Err(DbError::ConfigError("app_query_limit must be > 0".into()));
        }

        Ok(())
    }
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            dialect: DialectKind::Ansi,
            max_connections: 10,
            max_clause_values: 1000,
            app_query_limit: None,
            all_upper_case: false,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| DbError::ConfigError(format!("Invalid value '{}' for '{}'", value, key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DataSourceConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_clause_values, 1000);
        assert_eq!(config.dialect, DialectKind::Ansi);
        assert!(TransactionConfig::default().auto_join);
    }

    #[test]
    fn test_builder_pattern() {
        let config = DataSourceConfig::new("inventory")
            .max_connections(2)
            .max_clause_values(50)
            .app_query_limit(200);

        assert_eq!(config.name, "inventory");
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.policies().max_clause_values, 50);
        assert_eq!(config.app_query_limit, Some(200));
    }

    #[test]
    fn test_from_url() {
        let config = DataSourceConfig::from_url(
            "unifydb://inventory?max_connections=4&dialect=ANSI&all_upper_case=true",
        )
        .unwrap();

        assert_eq!(config.name, "inventory");
        assert_eq!(config.max_connections, 4);
        assert!(config.all_upper_case);
        assert_eq!(config.app_query_limit, None);
    }

    #[test]
    fn test_invalid_url() {
        assert!(DataSourceConfig::from_url("postgres://db").is_err());
        assert!(DataSourceConfig::from_url("unifydb://db?max_connections=0").is_err());
        assert!(DataSourceConfig::from_url("unifydb://db?colour=blue").is_err());
        assert!(DataSourceConfig::from_url("unifydb://db?dialect=oracle").is_err());
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let config =
            DataSourceConfig::from_json(r#"{ "name": "hr", "app_query_limit": 25 }"#).unwrap();
        assert_eq!(config.name, "hr");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.app_query_limit, Some(25));

        assert!(DataSourceConfig::from_json(r#"{ "name": "" }"#).is_err());
    }

    #[test]
    fn test_url_round_trip_keeps_settings() {
        let config = DataSourceConfig::new("hr").max_connections(3).app_query_limit(9);
        let parsed = DataSourceConfig::from_url(&config.to_url()).unwrap();
        assert_eq!(parsed, config);
    }
}
