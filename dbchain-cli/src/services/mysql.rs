//! MySQL / MariaDB client tooling behind [`DatabaseBackupPort`].

use dbchain_core::models::server::DatabaseEndpoint;
use dbchain_core::models::Server;
use dbchain_core::ports::{DatabaseBackupPort, DumpOptions, ExecutionContext};
use dbchain_core::{BackupError, Result};
use std::io::{self, Read, Write};

const COMPRESSION_LEVEL: i32 = 3;

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Counts bytes on their way to the inner writer.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct MysqlPort {
    server: String,
    endpoint: DatabaseEndpoint,
    exec: Box<dyn ExecutionContext>,
}

impl MysqlPort {
    pub fn new(server: &Server, exec: Box<dyn ExecutionContext>) -> Self {
        Self {
            server: server.name.clone(),
            endpoint: server.database.clone(),
            exec,
        }
    }

    fn with_credentials(&self, tool: &str, args: &str) -> String {
        let password = self
            .endpoint
            .password
            .as_deref()
            .map(|pw| format!("MYSQL_PWD={} ", shell_quote(pw)))
            .unwrap_or_default();
        format!(
            "{password}{tool} -h {} -P {} -u {} {args}",
            shell_quote(&self.endpoint.host),
            self.endpoint.port,
            shell_quote(&self.endpoint.user),
        )
    }

    fn query_command(&self, sql: &str) -> String {
        self.with_credentials("mysql", &format!("-N -B -e {}", shell_quote(sql)))
    }

    pub fn dump_command(&self, database: &str, options: &DumpOptions) -> String {
        let mut flags = Vec::new();
        if options.single_transaction {
            flags.push("--single-transaction");
        }
        // MariaDB and MySQL before 8.0.26 only know the older spelling.
        if options.record_log_position {
            flags.push("--master-data=2");
        }
        if options.routines {
            flags.push("--routines");
        }
        if options.triggers {
            flags.push("--triggers");
        }
        if options.events {
            flags.push("--events");
        }
        flags.push("--hex-blob");
        let args = format!("{} {}", flags.join(" "), shell_quote(database));
        self.with_credentials("mysqldump", &args)
    }

    fn apply_command(&self, database: &str) -> String {
        self.with_credentials("mysql", &shell_quote(database))
    }

    fn query(&self, sql: &str) -> Result<String> {
        self.exec.exec_capture(&self.query_command(sql))
    }

    /// Cheap round trip used to confirm the access path works.
    pub fn ping(&self) -> Result<()> {
        self.query("SELECT 1").map(|_| ())
    }
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

impl DatabaseBackupPort for MysqlPort {
    fn enumerate_databases(&self) -> Result<Vec<String>> {
        let out = self.query("SHOW DATABASES")?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn log_capture_available(&self) -> Result<bool> {
        let out = self.query("SELECT @@log_bin")?;
        let value = out.trim();
        Ok(value == "1" || value.eq_ignore_ascii_case("on"))
    }

    fn dump(&self, database: &str, options: &DumpOptions, sink: &mut dyn Write) -> Result<u64> {
        let command = self.dump_command(database, options);
        let mut counter = CountingWriter::new(sink);
        let mut encoder = zstd::Encoder::new(&mut counter, COMPRESSION_LEVEL)?;
        let raw = self.exec.exec_streaming(&command, &mut encoder).map_err(|e| BackupError::Dump {
            server: self.server.clone(),
            database: database.to_string(),
            reason: e.to_string(),
        })?;
        encoder.finish()?;
        tracing::debug!(
            server = %self.server,
            database,
            raw_bytes = raw,
            compressed_bytes = counter.count(),
            "Dump compressed"
        );
        Ok(counter.count())
    }

    fn apply(&self, database: &str, source: &mut dyn Read) -> Result<()> {
        let apply_error = |e: BackupError| BackupError::Apply {
            server: self.server.clone(),
            database: database.to_string(),
            reason: e.to_string(),
        };

        self.query(&format!("CREATE DATABASE IF NOT EXISTS {}", quote_identifier(database)))
            .map_err(apply_error)?;

        let mut decoder = zstd::Decoder::new(source)?;
        self.exec
            .exec_with_input(&self.apply_command(database), &mut decoder)
            .map_err(apply_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbchain_core::models::BackupKind;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorded {
        commands: Vec<String>,
        input: Vec<u8>,
    }

    /// Answers queries by substring match and records everything.
    struct ScriptedShell {
        answers: HashMap<&'static str, &'static str>,
        fail_on: Option<&'static str>,
        recorded: Rc<RefCell<Recorded>>,
    }

    impl ScriptedShell {
        fn new(answers: &[(&'static str, &'static str)]) -> (Self, Rc<RefCell<Recorded>>) {
            let recorded = Rc::new(RefCell::new(Recorded::default()));
            let shell = Self {
                answers: answers.iter().copied().collect(),
                fail_on: None,
                recorded: recorded.clone(),
            };
            (shell, recorded)
        }
    }

    impl ExecutionContext for ScriptedShell {
        fn exec_streaming(&self, command: &str, stdout: &mut dyn Write) -> Result<u64> {
            self.recorded.borrow_mut().commands.push(command.to_string());
            if self.fail_on.is_some_and(|needle| command.contains(needle)) {
                return Err(BackupError::Command("exit status: 2".into()));
            }
            let answer = self
                .answers
                .iter()
                .find(|(needle, _)| command.contains(*needle))
                .map(|(_, answer)| *answer)
                .unwrap_or("");
            stdout.write_all(answer.as_bytes())?;
            Ok(answer.len() as u64)
        }

        fn exec_with_input(&self, command: &str, stdin: &mut dyn Read) -> Result<()> {
            let mut recorded = self.recorded.borrow_mut();
            recorded.commands.push(command.to_string());
            stdin.read_to_end(&mut recorded.input)?;
            Ok(())
        }
    }

    fn server() -> Server {
        let config = dbchain_core::Config::parse(
            r#"
[[servers]]
name = "db1"
connection = "local"
[servers.database]
host = "10.0.0.5"
user = "backup"
password = "it's secret"
"#,
        )
        .unwrap();
        config.servers[0].clone()
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_enumerate_and_binlog() {
        let (shell, recorded) = ScriptedShell::new(&[
            ("SHOW DATABASES", "information_schema\napp\nbilling\n"),
            ("@@log_bin", "1\n"),
        ]);
        let port = MysqlPort::new(&server(), Box::new(shell));

        assert_eq!(port.enumerate_databases().unwrap(), vec!["information_schema", "app", "billing"]);
        assert!(port.log_capture_available().unwrap());

        let recorded = recorded.borrow();
        assert!(recorded.commands[0].starts_with(r"MYSQL_PWD='it'\''s secret' mysql -h '10.0.0.5' -P 3306 -u 'backup'"));
    }

    #[test]
    fn test_binlog_off() {
        let (shell, _) = ScriptedShell::new(&[("@@log_bin", "0\n")]);
        let port = MysqlPort::new(&server(), Box::new(shell));
        assert!(!port.log_capture_available().unwrap());
    }

    #[test]
    fn test_dump_flags_follow_kind() {
        let (shell, _) = ScriptedShell::new(&[]);
        let port = MysqlPort::new(&server(), Box::new(shell));

        let full = port.dump_command("app", &DumpOptions::for_kind(BackupKind::Full));
        assert!(full.contains("mysqldump"));
        assert!(full.contains("--single-transaction --routines --triggers --events"));
        assert!(!full.contains("--master-data"));
        assert!(full.ends_with("'app'"));

        let incr = port.dump_command("app", &DumpOptions::for_kind(BackupKind::Incremental));
        assert!(incr.contains("--single-transaction --master-data=2 --routines"));
        assert!(!incr.contains("--source-data"));
    }

    #[test]
    fn test_dump_is_compressed() {
        let (shell, _) = ScriptedShell::new(&[("mysqldump", "CREATE TABLE t (id INT);\n")]);
        let port = MysqlPort::new(&server(), Box::new(shell));

        let mut sink = Vec::new();
        let written = port
            .dump("app", &DumpOptions::for_kind(BackupKind::Full), &mut sink)
            .unwrap();
        assert_eq!(written, sink.len() as u64);
        let plain = zstd::decode_all(sink.as_slice()).unwrap();
        assert_eq!(plain, b"CREATE TABLE t (id INT);\n");
    }

    #[test]
    fn test_failed_dump_is_dump_error() {
        let (mut shell, _) = ScriptedShell::new(&[]);
        shell.fail_on = Some("mysqldump");
        let port = MysqlPort::new(&server(), Box::new(shell));
        let err = port
            .dump("app", &DumpOptions::for_kind(BackupKind::Full), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, BackupError::Dump { .. }));
    }

    #[test]
    fn test_apply_decompresses() {
        let (shell, recorded) = ScriptedShell::new(&[]);
        let port = MysqlPort::new(&server(), Box::new(shell));

        let compressed = zstd::encode_all(&b"INSERT INTO t VALUES (1);\n"[..], 3).unwrap();
        port.apply("app", &mut compressed.as_slice()).unwrap();

        let recorded = recorded.borrow();
        assert!(recorded.commands[0].contains("CREATE DATABASE IF NOT EXISTS `app`"));
        assert!(recorded.commands[1].ends_with("'app'"));
        assert_eq!(recorded.input, b"INSERT INTO t VALUES (1);\n");
    }
}
