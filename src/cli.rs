//! Interface de linha de comando do inkflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, resume, demo,
//! pipeline) e flags globais (--config, --model, --workers, --max-attempts,
//! --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::pipeline::{GeneratorType, ModelTier};

/// inkflow: fila de jobs de geração de conteúdo em lote.
#[derive(Debug, Parser)]
#[command(name = "inkflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./inkflow.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Força um nível de modelo para todos os estágios.
    #[arg(long, global = true)]
    pub model: Option<ModelArg>,

    /// Tentativas por estágio, incluindo a primeira (3 = até 2 retentativas).
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Tamanho do pool de workers.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Argumento de modelo aceito pela CLI, mapeado para [`ModelTier`] internamente.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModelArg {
    /// Modelo rápido e econômico para estágios simples.
    Haiku,
    /// Modelo equilibrado para redação.
    Sonnet,
    /// Modelo mais capaz.
    Opus,
}

impl From<ModelArg> for ModelTier {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Haiku => ModelTier::Haiku,
            ModelArg::Sonnet => ModelTier::Sonnet,
            ModelArg::Opus => ModelTier::Opus,
        }
    }
}

/// Tipo de gerador aceito pela CLI.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GeneratorArg {
    /// Um único estágio produz o artigo final.
    SingleAgent,
    /// Esboço, rascunho, SEO e edição.
    MultiAgent,
}

impl From<GeneratorArg> for GeneratorType {
    fn from(arg: GeneratorArg) -> Self {
        match arg {
            GeneratorArg::SingleAgent => GeneratorType::SingleAgent,
            GeneratorArg::MultiAgent => GeneratorType::MultiAgent,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submete um lote a partir de um arquivo JSON ou TOML e acompanha o progresso.
    Run {
        /// Caminho do arquivo do lote.
        #[arg(long)]
        file: PathBuf,

        /// Sobrescreve o tipo de gerador do arquivo.
        #[arg(long)]
        generator: Option<GeneratorArg>,

        /// Sobrescreve a organização do arquivo.
        #[arg(long)]
        org: Option<String>,

        /// Diretório onde os artigos finais são gravados.
        #[arg(long, default_value = "out")]
        out: PathBuf,

        /// Persiste o estado dos jobs neste diretório em vez de em memória.
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Retoma um job gravado em --state-dir por uma execução anterior.
    Resume {
        /// Identificador do job.
        job_id: String,

        #[arg(long)]
        state_dir: PathBuf,

        #[arg(long, default_value = "out")]
        out: PathBuf,
    },

    /// Executa um lote simulado multi-agent com um item instável.
    Demo {
        /// Quantidade de tópicos no lote.
        #[arg(long, default_value_t = 5)]
        items: usize,
    },

    /// Lista os estágios do pipeline de um tipo de gerador.
    Pipeline {
        generator: GeneratorArg,
    },
}
