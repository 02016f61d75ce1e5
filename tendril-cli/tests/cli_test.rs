use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn run_tendril(args: &[&str], config: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tendril"))
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .env_remove("TENDRIL_LOG_LEVEL")
        .env_remove("TENDRIL_PLUGINS_DIR")
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("Failed to execute tendril command")
}

fn output_to_string(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr_to_string(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// A plugins directory plus a config file pointing at it.
struct Workspace {
    _temp: TempDir,
    plugins: PathBuf,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let plugins = temp.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        let config = temp.path().join("tendril.toml");
        std::fs::write(
            &config,
            format!(
                "[plugins]\ndir = \"{}\"\n\n[logging]\nlevel = \"error\"\n",
                plugins.display().to_string().replace('\\', "/")
            ),
        )
        .unwrap();
        Self {
            _temp: temp,
            plugins,
            config,
        }
    }

    fn plugin(&self, id: &str, extra: &str) -> &Self {
        let dir = self.plugins.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("tendril-plugin.toml"),
            format!("id = \"{id}\"\nversion = \"1.0.0\"\nentry_point = \"{id}\"\n{extra}"),
        )
        .unwrap();
        self
    }

    fn run(&self, args: &[&str]) -> Output {
        run_tendril(args, &self.config)
    }
}

mod validate_command_tests {
    use super::*;

    #[test]
    fn test_valid_plugins() {
        let ws = Workspace::new();
        ws.plugin("auth", "").plugin("chat", "dependencies = [\"auth\"]\n");

        let output = ws.run(&["validate"]);
        let stdout = output_to_string(&output);
        assert!(output.status.success(), "stderr: {}", stderr_to_string(&output));
        assert!(stdout.contains("auth"));
        assert!(stdout.contains("2 valid"));
    }

    #[test]
    fn test_invalid_manifest_fails() {
        let ws = Workspace::new();
        ws.plugin("broken", "capabilities = [\"teleport\"]\n");

        let output = ws.run(&["validate", "--format", "json"]);
        assert!(!output.status.success());

        let report: serde_json::Value = serde_json::from_str(&output_to_string(&output)).unwrap();
        assert_eq!(report["invalid"], 1);
        assert_eq!(report["results"][0]["error_code"], "E1002");
        assert_eq!(
            report["results"][0]["violations"][0]["field"],
            "capabilities[0]"
        );
        assert!(stderr_to_string(&output).contains("failed validation"));
    }

    #[test]
    fn test_grants_check() {
        let ws = Workspace::new();
        ws.plugin("fetcher", "capabilities = [\"network:outbound\"]\n");

        assert!(ws.run(&["validate"]).status.success());

        let output = ws.run(&["validate", "--grants"]);
        assert!(!output.status.success());
        assert!(output_to_string(&output).contains("E1003"));
    }
}

mod order_command_tests {
    use super::*;

    #[test]
    fn test_order_json() {
        let ws = Workspace::new();
        ws.plugin("web", "dependencies = [\"db\"]\n")
            .plugin("db", "")
            .plugin("cron", "");

        let output = ws.run(&["order", "--format", "json"]);
        assert!(output.status.success(), "stderr: {}", stderr_to_string(&output));

        let report: serde_json::Value = serde_json::from_str(&output_to_string(&output)).unwrap();
        assert_eq!(report["order"], serde_json::json!(["cron", "db", "web"]));
    }

    #[test]
    fn test_cycle_is_reported() {
        let ws = Workspace::new();
        ws.plugin("a", "dependencies = [\"b\"]\n")
            .plugin("b", "dependencies = [\"a\"]\n");

        let output = ws.run(&["order"]);
        assert!(!output.status.success());
        assert!(output_to_string(&output).contains("a -> b -> a"));
    }
}

mod inspect_command_tests {
    use super::*;

    #[test]
    fn test_list_json() {
        let ws = Workspace::new();
        ws.plugin("auth", "hooks = [\"on_login\"]\n");

        let output = ws.run(&["list", "--format", "json"]);
        assert!(output.status.success());

        let plugins: serde_json::Value = serde_json::from_str(&output_to_string(&output)).unwrap();
        assert_eq!(plugins[0]["id"], "auth");
        assert_eq!(plugins[0]["state"], "validated");
    }

    #[test]
    fn test_hooks_filter() {
        let ws = Workspace::new();
        ws.plugin("auth", "hooks = [\"on_login\"]\n")
            .plugin("audit", "hooks = [{ name = \"on_login\", priority = -1 }]\n");

        let output = ws.run(&["hooks", "on_login", "--format", "json"]);
        assert!(output.status.success());

        let hooks: serde_json::Value = serde_json::from_str(&output_to_string(&output)).unwrap();
        assert_eq!(hooks["on_login"][0]["plugin_id"], "audit");
        assert_eq!(hooks["on_login"][1]["plugin_id"], "auth");

        assert!(!ws.run(&["hooks", "on_logout"]).status.success());
    }

    #[test]
    fn test_config_shows_effective_values() {
        let ws = Workspace::new();
        let output = ws.run(&["config", "--format", "json"]);
        assert!(output.status.success());

        let config: serde_json::Value = serde_json::from_str(&output_to_string(&output)).unwrap();
        assert_eq!(config["logging"]["level"], "error");
        assert!(config["hooks"]["history_size"].is_number());
    }
}
