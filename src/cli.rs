//! Interface de linha de comando do benchgrid baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (compile, run, status,
//! policy, claims) e flags globais (--config, --host, --verbose, --json-logs).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::CONFIG_FILE;

/// benchgrid: coordena matrizes de benchmark entre hosts via repositório git.
#[derive(Debug, Parser)]
#[command(name = "benchgrid", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Identidade do host, sobrescrevendo ambiente e configuração.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emite logs estruturados em JSON.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Expande as fases configuradas em manifestos e os publica.
    Compile {
        /// Compila apenas esta fase.
        #[arg(long)]
        phase: Option<String>,

        /// Simulação: imprime os manifestos sem tocar no repositório.
        #[arg(long, visible_alias = "dry-run", default_value_t = false)]
        no_publish: bool,
    },

    /// Executa o laço de trabalho deste host até esgotar a fila.
    Run {
        /// Restringe o laço a uma fase permitida.
        #[arg(long)]
        phase: Option<String>,

        /// Para depois de executar este número de itens.
        #[arg(long)]
        max_items: Option<usize>,

        /// Não retoma claims deixados por este host.
        #[arg(long, default_value_t = false)]
        no_resume: bool,
    },

    /// Mostra o progresso de cada fase.
    Status {
        /// Mostra apenas esta fase.
        #[arg(long)]
        phase: Option<String>,
    },

    /// Mostra a política efetiva deste host.
    Policy,

    /// Inspeciona e limpa marcadores de claim.
    Claims {
        #[command(subcommand)]
        action: ClaimsAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ClaimsAction {
    /// Lista todos os marcadores com dono e idade.
    List,

    /// Remove o marcador de um item abandonado.
    Clear {
        /// Nome canônico do item, ex.: `salad_qwen3-8b_base_0.json`.
        item: String,

        /// Remove mesmo que o marcador pertença a outro host.
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Remove marcadores de itens concluídos ou fora de qualquer manifesto.
    Prune,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["benchgrid", "run", "--phase", "p1", "--max-items", "3"]);
        match cli.command {
            Command::Run {
                phase,
                max_items,
                no_resume,
            } => {
                assert_eq!(phase.as_deref(), Some("p1"));
                assert_eq!(max_items, Some(3));
                assert!(!no_resume);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "benchgrid",
            "--config",
            "other.toml",
            "--host",
            "gpu-1",
            "--verbose",
            "--json-logs",
            "policy",
        ]);
        assert!(cli.verbose);
        assert!(cli.json_logs);
        assert_eq!(cli.host.as_deref(), Some("gpu-1"));
        assert_eq!(cli.config, PathBuf::from("other.toml"));
        assert!(matches!(cli.command, Command::Policy));
    }

    #[test]
    fn cli_defaults_config_path() {
        let cli = Cli::parse_from(["benchgrid", "status"]);
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE));
    }

    #[test]
    fn cli_parses_claims_clear() {
        let cli = Cli::parse_from(["benchgrid", "claims", "clear", "l_a_c_0.json", "--force"]);
        match cli.command {
            Command::Claims {
                action: ClaimsAction::Clear { item, force },
            } => {
                assert_eq!(item, "l_a_c_0.json");
                assert!(force);
            }
            _ => panic!("expected Claims Clear command"),
        }
    }

    #[test]
    fn cli_accepts_dry_run_alias() {
        let cli = Cli::parse_from(["benchgrid", "compile", "--dry-run"]);
        assert!(matches!(cli.command, Command::Compile { no_publish: true, .. }));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
