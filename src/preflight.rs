//! Preflight validation of the replication account and the primary's
//! binlog configuration. Every failure here is fatal before any stage
//! is entered.

use tracing::info;

use crate::error::{EngineError, Result};
use crate::primary::SqlRunner;
use crate::settings::Settings;

const REQUIRED_GRANTS: &[&str] = &["REPLICATION SLAVE"];

const OPTIONAL_GRANTS: &[&str] = &["REPLICATION CLIENT", "BINLOG MONITOR"];

/// The account must not be able to write: any of these in the grant set
/// rejects it.
const FORBIDDEN_GRANTS: &[&str] = &[
    "SUPER",
    "ALL PRIVILEGES",
    "INSERT",
    "UPDATE",
    "DELETE",
    "DROP",
    "ALTER",
    "CREATE",
    "TRUNCATE",
];

const REQUIRED_VARIABLES: &[(&str, &str)] = &[
    ("log_bin", "ON"),
    ("binlog_format", "ROW"),
    ("binlog_row_image", "FULL"),
    ("binlog_row_metadata", "FULL"),
    ("binlog_gtid_index", "ON"),
    ("gtid_strict_mode", "ON"),
];

/// Runs the full preflight sequence: grants, server variables, a
/// read-only probe, a throwaway replication connection (`probe`), and
/// stream-table existence.
pub fn preflight_check(
    runner: &mut dyn SqlRunner,
    settings: &Settings,
    probe: impl FnOnce() -> Result<()>,
) -> Result<()> {
    check_grants(runner)?;
    check_variables(runner)?;
    assert_readonly(runner)?;
    probe().map_err(|e| EngineError::Preflight(format!("replication probe failed: {e}")))?;
    if !settings.stream_tables.is_empty() {
        check_tables(runner, &settings.db_name, &settings.stream_tables)?;
    }
    info!("preflight passed");
    Ok(())
}

fn check_grants(runner: &mut dyn SqlRunner) -> Result<()> {
    let rows = runner.fetch_rows("SHOW GRANTS FOR CURRENT_USER")?;
    let grants: String = rows
        .iter()
        .flatten()
        .map(|g| g.to_uppercase())
        .collect::<Vec<_>>()
        .join(" ");

    let missing: Vec<&str> = REQUIRED_GRANTS
        .iter()
        .filter(|g| !grants.contains(*g))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::Preflight(format!(
            "missing required privileges: {missing:?}"
        )));
    }

    if !OPTIONAL_GRANTS.iter().any(|g| grants.contains(g)) {
        return Err(EngineError::Preflight(format!(
            "missing monitoring privilege, need one of: {OPTIONAL_GRANTS:?}"
        )));
    }

    let forbidden: Vec<&str> = FORBIDDEN_GRANTS
        .iter()
        .filter(|g| grants.contains(*g))
        .copied()
        .collect();
    if !forbidden.is_empty() {
        return Err(EngineError::Preflight(format!(
            "forbidden privileges detected: {forbidden:?}"
        )));
    }

    Ok(())
}

fn check_variables(runner: &mut dyn SqlRunner) -> Result<()> {
    let rows = runner.fetch_rows(
        "SHOW GLOBAL VARIABLES WHERE Variable_name IN \
         ('log_bin','binlog_format','binlog_row_metadata','binlog_row_image',\
          'server_id','binlog_gtid_index','gtid_strict_mode')",
    )?;

    let mut errors = Vec::new();
    let vars: Vec<(String, String)> = rows
        .into_iter()
        .filter_map(|row| {
            let mut row = row.into_iter();
            Some((row.next()?.to_lowercase(), row.next()?))
        })
        .collect();
    let get = |name: &str| {
        vars.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    };

    for (name, expected) in REQUIRED_VARIABLES {
        let actual = get(name);
        if !actual.eq_ignore_ascii_case(expected) {
            errors.push(format!("{name} is `{actual}`, expected {expected}"));
        }
    }
    if get("server_id").parse::<u64>().unwrap_or(0) == 0 {
        errors.push("server_id not set".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Preflight(errors.join("; ")))
    }
}

fn assert_readonly(runner: &mut dyn SqlRunner) -> Result<()> {
    match runner.fetch_rows("CREATE TEMPORARY TABLE preflight_probe_tmp (id INT)") {
        Err(_) => Ok(()),
        Ok(_) => Err(EngineError::Preflight(
            "account can CREATE tables, refusing to run with a writable account".into(),
        )),
    }
}

fn check_tables(runner: &mut dyn SqlRunner, db_name: &str, tables: &[String]) -> Result<()> {
    let rows = runner.fetch_rows(&format!("SHOW TABLES FROM {db_name}"))?;
    let existing: Vec<&String> = rows.iter().filter_map(|row| row.first()).collect();
    let missing: Vec<&String> = tables.iter().filter(|t| !existing.contains(t)).collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Preflight(format!(
            "tables not found in {db_name}: {missing:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{PrimarySettings, Settings};

    struct FakeRunner {
        grants: Vec<&'static str>,
        variables: Vec<(&'static str, &'static str)>,
        tables: Vec<&'static str>,
        create_fails: bool,
    }

    impl FakeRunner {
        fn healthy() -> FakeRunner {
            FakeRunner {
                grants: vec!["GRANT REPLICATION SLAVE, BINLOG MONITOR ON *.* TO `binlog_reader`@`%`"],
                variables: vec![
                    ("log_bin", "ON"),
                    ("binlog_format", "ROW"),
                    ("binlog_row_image", "FULL"),
                    ("binlog_row_metadata", "FULL"),
                    ("server_id", "1"),
                    ("binlog_gtid_index", "ON"),
                    ("gtid_strict_mode", "ON"),
                ],
                tables: vec!["items", "items2"],
                create_fails: true,
            }
        }
    }

    impl SqlRunner for FakeRunner {
        fn fetch_rows(&mut self, sql: &str) -> Result<Vec<Vec<String>>> {
            if sql.starts_with("SHOW GRANTS") {
                Ok(self.grants.iter().map(|g| vec![g.to_string()]).collect())
            } else if sql.starts_with("SHOW GLOBAL VARIABLES") {
                Ok(self
                    .variables
                    .iter()
                    .map(|(k, v)| vec![k.to_string(), v.to_string()])
                    .collect())
            } else if sql.starts_with("CREATE TEMPORARY TABLE") {
                if self.create_fails {
                    Err(EngineError::Stream("denied".into()))
                } else {
                    Ok(Vec::new())
                }
            } else if sql.starts_with("SHOW TABLES") {
                Ok(self.tables.iter().map(|t| vec![t.to_string()]).collect())
            } else {
                panic!("unexpected statement: {sql}")
            }
        }
    }

    fn settings() -> Settings {
        Settings {
            primary: PrimarySettings {
                host: "127.0.0.1".into(),
                port: 3306,
                user: "binlog_reader".into(),
                password: "strong_pass".into(),
            },
            db_name: "mirror_test".into(),
            snapshot_tables: vec!["items".into(), "items2".into()],
            stream_tables: vec!["items".into(), "items2".into()],
            snapshot_workers: 2,
            snapshot_batch: 10,
            checkpoint_path: "./binlog.pos".into(),
            health_socket_path: "./health.sock".into(),
            sink_module: "memory".into(),
        }
    }

    #[test]
    fn healthy_primary_passes() {
        let mut runner = FakeRunner::healthy();
        preflight_check(&mut runner, &settings(), || Ok(())).unwrap();
    }

    #[test]
    fn missing_replication_slave_rejected() {
        let mut runner = FakeRunner::healthy();
        runner.grants = vec!["GRANT BINLOG MONITOR ON *.* TO user"];
        let err = preflight_check(&mut runner, &settings(), || Ok(())).unwrap_err();
        assert!(err.to_string().contains("missing required privileges"));
    }

    #[test]
    fn missing_monitoring_privilege_rejected() {
        let mut runner = FakeRunner::healthy();
        runner.grants = vec!["GRANT REPLICATION SLAVE ON *.* TO user"];
        let err = preflight_check(&mut runner, &settings(), || Ok(())).unwrap_err();
        assert!(err.to_string().contains("monitoring privilege"));
    }

    #[test]
    fn writable_account_rejected() {
        let mut runner = FakeRunner::healthy();
        runner.grants =
            vec!["GRANT REPLICATION SLAVE, REPLICATION CLIENT, INSERT ON *.* TO user"];
        let err = preflight_check(&mut runner, &settings(), || Ok(())).unwrap_err();
        assert!(err.to_string().contains("forbidden privileges"));
    }

    #[test]
    fn statement_based_binlog_rejected() {
        let mut runner = FakeRunner::healthy();
        runner.variables[1] = ("binlog_format", "STATEMENT");
        let err = preflight_check(&mut runner, &settings(), || Ok(())).unwrap_err();
        assert!(err.to_string().contains("binlog_format"));
    }

    #[test]
    fn unset_server_id_rejected() {
        let mut runner = FakeRunner::healthy();
        runner.variables[4] = ("server_id", "0");
        let err = preflight_check(&mut runner, &settings(), || Ok(())).unwrap_err();
        assert!(err.to_string().contains("server_id"));
    }

    #[test]
    fn creatable_tables_rejected() {
        let mut runner = FakeRunner::healthy();
        runner.create_fails = false;
        let err = preflight_check(&mut runner, &settings(), || Ok(())).unwrap_err();
        assert!(err.to_string().contains("CREATE"));
    }

    #[test]
    fn missing_stream_table_rejected() {
        let mut runner = FakeRunner::healthy();
        runner.tables = vec!["items"];
        let err = preflight_check(&mut runner, &settings(), || Ok(())).unwrap_err();
        assert!(err.to_string().contains("items2"));
    }

    #[test]
    fn probe_failure_rejected() {
        let mut runner = FakeRunner::healthy();
        let err = preflight_check(&mut runner, &settings(), || {
            Err(EngineError::Stream("connection refused".into()))
        })
        .unwrap_err();
        assert!(err.to_string().contains("replication probe failed"));
    }

    #[test]
    fn empty_stream_tables_skips_table_check() {
        let mut runner = FakeRunner::healthy();
        runner.tables = vec![];
        let mut s = settings();
        s.stream_tables.clear();
        preflight_check(&mut runner, &s, || Ok(())).unwrap();
    }
}
