//! Interface de linha de comando do corretor baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] e as flags globais
//! `--config` e `--verbose`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use corrector::state_machine::{CorrectionType, WorkStatus};

/// Pipeline de correção de conteúdo com escalonamento entre tiers de modelo.
#[derive(Debug, Parser)]
#[command(name = "corrector", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./corrector.toml).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (nível debug).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Roda todas as lanes, o backlog e a manutenção até Ctrl-C.
    Run,

    /// Executa uma passada do controlador de backlog.
    Fill {
        /// Tipo de correção; todos quando omitido.
        #[arg(long = "type")]
        correction_type: Option<CorrectionType>,
    },

    /// Reivindica e processa itens pendentes de um tipo, uma vez.
    Drain {
        #[arg(long = "type")]
        correction_type: CorrectionType,

        /// Máximo de itens reivindicados.
        #[arg(long, default_value_t = 1)]
        limit: usize,
    },

    /// Executa reclaimer, janitor e collapser uma vez.
    Maintain,

    /// Mostra contagens, custo estimado e taxa de sucesso.
    Status {
        #[arg(long = "type")]
        correction_type: Option<CorrectionType>,

        /// Janela da taxa de sucesso, em horas.
        #[arg(long, default_value_t = 24)]
        window_hours: i64,
    },

    /// Lista work items filtrados.
    List {
        #[arg(long)]
        status: Option<WorkStatus>,

        #[arg(long = "type")]
        correction_type: Option<CorrectionType>,

        #[arg(long)]
        subject: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Mostra um work item completo em JSON.
    Show { id: String },

    /// Processa itens pendentes imediatamente, fora das lanes.
    Process {
        #[arg(required = true)]
        ids: Vec<String>,

        /// Tier inicial pelo nome (padrão: o mais barato).
        #[arg(long)]
        tier: Option<String>,
    },

    /// Apaga itens Pending ou Failed.
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}
