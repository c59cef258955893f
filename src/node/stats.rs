//! Salud de un nodo: stats vigentes, ventana de pings y score
//! compuesto (menor es mejor) que gobierna selección y migración.

use crate::protocol::StatsPayload;
use std::collections::VecDeque;
use std::time::Instant;

/// Máximo de muestras de ping retenidas.
pub const PING_WINDOW: usize = 10;

/// Estado de salud acumulado de un nodo.
#[derive(Debug)]
pub struct NodeHealth {
    stats: Option<StatsPayload>,
    updated_at: Option<Instant>,
    pings: VecDeque<u64>,
}

impl NodeHealth {
    pub fn new() -> Self {
        Self {
            stats: None,
            updated_at: None,
            pings: VecDeque::with_capacity(PING_WINDOW),
        }
    }

    pub fn update_stats(&mut self, stats: StatsPayload) {
        self.stats = Some(stats);
        self.updated_at = Some(Instant::now());
    }

    pub fn record_ping(&mut self, ping_ms: u64) {
        if self.pings.len() == PING_WINDOW {
            self.pings.pop_front();
        }
        self.pings.push_back(ping_ms);
    }

    pub fn stats(&self) -> Option<&StatsPayload> {
        self.stats.as_ref()
    }

    /// Edad del último snapshot de stats.
    pub fn freshness(&self) -> Option<std::time::Duration> {
        self.updated_at.map(|t| t.elapsed())
    }

    /// Promedio de la ventana de pings, en milisegundos.
    pub fn average_ping(&self) -> f64 {
        if self.pings.is_empty() {
            return 0.0;
        }
        self.pings.iter().sum::<u64>() as f64 / self.pings.len() as f64
    }

    pub fn last_ping(&self) -> Option<u64> {
        self.pings.back().copied()
    }

    /// Penalizaciones crudas derivadas de las stats.
    pub fn penalties(&self) -> f64 {
        let Some(stats) = &self.stats else {
            return 0.0;
        };
        let cores = stats.cpu.cores.max(1) as f64;
        let deficit = stats
            .frame_stats
            .as_ref()
            .map(|f| f.deficit.max(0) as f64)
            .unwrap_or(0.0);

        stats.playing_players as f64
            + (stats.cpu.system_load / cores) * 10.0
            + deficit * 2.5
            + stats.players as f64
    }

    /// Score compuesto; menor es mejor. Un nodo sin stats queda al
    /// final de cualquier orden.
    pub fn score(&self) -> f64 {
        let Some(stats) = &self.stats else {
            return f64::MAX;
        };
        let cores = stats.cpu.cores.max(1) as f64;
        let cpu_load = stats.cpu.system_load / cores;
        let mem_usage = if stats.memory.allocated > 0 {
            stats.memory.used as f64 / stats.memory.allocated as f64
        } else {
            0.0
        };

        self.penalties() * 10.0
            + cpu_load * 100.0
            + mem_usage * 0.5
            + self.average_ping() * 0.1
            + stats.players as f64 * 2.0
            + stats.playing_players as f64 * 5.0
    }
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CpuStats, FrameStats, MemoryStats};

    fn stats(players: u32, playing: u32, load: f64, cores: u32, deficit: i64) -> StatsPayload {
        StatsPayload {
            players,
            playing_players: playing,
            uptime: 1000,
            memory: MemoryStats {
                free: 0,
                used: 512,
                allocated: 1024,
                reservable: 2048,
            },
            cpu: CpuStats {
                cores,
                system_load: load,
                lavalink_load: 0.1,
            },
            frame_stats: Some(FrameStats {
                sent: 3000,
                nulled: 0,
                deficit,
            }),
        }
    }

    #[test]
    fn test_penalties_segun_formula() {
        let mut health = NodeHealth::new();
        health.update_stats(stats(4, 2, 2.0, 4, 10));
        // 2·1 + (2/4)·10 + 10·2.5 + 4 = 36
        assert!((health.penalties() - 36.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_deficit_negativo_no_penaliza() {
        let mut health = NodeHealth::new();
        health.update_stats(stats(0, 0, 0.0, 4, -5));
        assert_eq!(health.penalties(), 0.0);
    }

    #[test]
    fn test_sin_stats_score_maximo() {
        let health = NodeHealth::new();
        assert_eq!(health.score(), f64::MAX);
    }

    #[test]
    fn test_mas_carga_peor_score() {
        let mut tranquilo = NodeHealth::new();
        tranquilo.update_stats(stats(1, 0, 0.1, 4, 0));

        let mut cargado = NodeHealth::new();
        cargado.update_stats(stats(40, 30, 3.5, 4, 50));

        assert!(tranquilo.score() < cargado.score());
    }

    #[test]
    fn test_ventana_de_pings_acotada() {
        let mut health = NodeHealth::new();
        for i in 0..20 {
            health.record_ping(i);
        }
        assert_eq!(health.last_ping(), Some(19));
        // Sólo quedan las últimas 10 muestras: 10..=19
        assert!((health.average_ping() - 14.5).abs() < f64::EPSILON);
    }
}
