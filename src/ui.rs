//! Interface de terminal do inkflow: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente um job
//! a partir dos snapshots obtidos por polling.

use std::collections::HashSet;

use anyhow::Result;
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::job::{ItemState, JobStatus};
use crate::pipeline::Pipeline;
use crate::status::{ItemSnapshot, JobStatusSnapshot};

/// Indicador visual de progresso de um job no terminal.
///
/// Cada item terminal é anunciado uma única vez: verde para concluído,
/// vermelho para falha, cinza para cancelado. Retentativas aparecem em amarelo.
pub struct JobProgress {
    // Barra de progresso do indicatif.
    pb: ProgressBar,
    // Itens terminais já anunciados.
    reported: HashSet<usize>,
    // (item, estágio, tentativa) de retentativas já anunciadas.
    retries: HashSet<(usize, usize, u32)>,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl JobProgress {
    /// Inicia a barra com o total de itens do job.
    pub fn start(job_id: &str, total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.set_message(format!("job {job_id}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self::with_bar(pb)
    }

    fn with_bar(pb: ProgressBar) -> Self {
        Self {
            pb,
            reported: HashSet::new(),
            retries: HashSet::new(),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Itens que ficaram terminais desde o último snapshot.
    fn newly_settled<'a>(&mut self, snapshot: &'a JobStatusSnapshot) -> Vec<&'a ItemSnapshot> {
        snapshot
            .items
            .iter()
            .filter(|item| item.state.is_terminal() && self.reported.insert(item.index))
            .collect()
    }

    /// Itens processando um estágio que já falhou antes.
    fn new_retries<'a>(&mut self, snapshot: &'a JobStatusSnapshot) -> Vec<(&'a ItemSnapshot, u32)> {
        snapshot
            .items
            .iter()
            .filter(|item| item.state == ItemState::Processing)
            .filter_map(|item| {
                let attempt = item.attempts.get(item.stage_index).copied()?;
                (attempt > 1 && self.retries.insert((item.index, item.stage_index, attempt)))
                    .then_some((item, attempt))
            })
            .collect()
    }

    /// Atualiza a barra e imprime os eventos novos do snapshot.
    pub fn update(&mut self, snapshot: &JobStatusSnapshot) {
        let p = &snapshot.progress;
        self.pb.set_length(p.total as u64);
        self.pb
            .set_position((p.completed + p.failed + p.cancelled) as u64);
        let eta = p
            .estimated_time_remaining_ms
            .map(|ms| format!(" · eta {:.1}s", ms as f64 / 1000.0))
            .unwrap_or_default();
        self.pb.set_message(format!(
            "{} processing · {} queued · ${:.4}{eta}",
            p.processing, p.pending, snapshot.total_cost_usd
        ));

        for (item, attempt) in self.new_retries(snapshot) {
            self.pb.println(format!(
                "  {} #{} {}: stage {} attempt {attempt}",
                self.yellow.apply_to("↻"),
                item.index,
                item.topic,
                item.stage_index
            ));
        }

        for item in self.newly_settled(snapshot) {
            let line = match item.state {
                ItemState::Completed => format!(
                    "  {} #{} {} ({} words, ${:.4})",
                    self.green.apply_to("✓"),
                    item.index,
                    item.topic,
                    item.word_count.unwrap_or(0),
                    item.cost_usd.unwrap_or(0.0)
                ),
                ItemState::Failed => {
                    let reason = item
                        .error
                        .as_ref()
                        .map(|e| format!("{} at stage {}: {}", e.kind, e.stage_index, e.message))
                        .unwrap_or_default();
                    format!(
                        "  {} #{} {}: {reason}",
                        self.red.apply_to("✗"),
                        item.index,
                        item.topic
                    )
                }
                _ => format!(
                    "  {} #{} {} cancelled",
                    self.dim.apply_to("-"),
                    item.index,
                    item.topic
                ),
            };
            self.pb.println(line);
        }
    }

    /// Finaliza a barra e exibe o status final do job.
    pub fn finish(&self, snapshot: &JobStatusSnapshot) {
        self.pb.finish_and_clear();
        let p = &snapshot.progress;
        let style = match snapshot.status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        println!(
            "  {} {}/{} completed, {} failed, {} cancelled · {} tokens · ${:.6}",
            style.apply_to(format!("Job {}", snapshot.status)),
            p.completed,
            p.total,
            p.failed,
            p.cancelled,
            snapshot.total_tokens,
            snapshot.total_cost_usd
        );
    }
}

/// Imprime o snapshot final em JSON.
pub fn print_snapshot(snapshot: &JobStatusSnapshot) -> Result<()> {
    println!();
    println!("{}", Style::new().cyan().apply_to("─── Job Snapshot ───"));
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(())
}

/// Imprime os estágios de um pipeline, um por linha.
pub fn print_pipeline(pipeline: &Pipeline) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to(pipeline.generator_type()));
    for (i, stage) in pipeline.stages().iter().enumerate() {
        let requires = if stage.spec.requires.is_empty() {
            String::new()
        } else {
            let names: Vec<&str> = stage.spec.requires.iter().map(|k| k.name()).collect();
            format!(" <- {}", names.join(", "))
        };
        println!(
            "  {i}. {} [{}, {} max tokens, {}]{requires}",
            stage.spec.name(),
            stage.spec.tier.api_model(),
            stage.spec.max_tokens,
            stage.executor.name()
        );
    }
}
