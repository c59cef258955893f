//! Cola de reproducción por guild.

use crate::{protocol::Track, Error, Result};
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

/// Cola ordenada de tracks con inserción arbitraria, shuffle y
/// búsqueda.
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<Track>,
    max_size: usize,
}

impl TrackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega un track al final de la cola.
    pub fn add(&mut self, track: Track) -> Result<()> {
        if self.items.len() >= self.max_size {
            return Err(Error::Validation(format!(
                "la cola está llena (máximo {} canciones)",
                self.max_size
            )));
        }
        self.items.push_back(track);
        Ok(())
    }

    /// Agrega múltiples tracks (playlist); devuelve cuántos entraron.
    pub fn add_many(&mut self, tracks: Vec<Track>) -> usize {
        let available = self.max_size.saturating_sub(self.items.len());
        let to_add = tracks.len().min(available);
        for track in tracks.into_iter().take(to_add) {
            self.items.push_back(track);
        }
        info!("➕ Agregadas {} canciones a la cola", to_add);
        to_add
    }

    /// Inserta en una posición arbitraria.
    pub fn insert(&mut self, index: usize, track: Track) -> Result<()> {
        if self.items.len() >= self.max_size {
            return Err(Error::Validation("la cola está llena".into()));
        }
        if index > self.items.len() {
            return Err(Error::Validation(format!("índice fuera de rango: {index}")));
        }
        self.items.insert(index, track);
        Ok(())
    }

    /// Devuelve el próximo track a reproducir.
    pub fn pop_front(&mut self) -> Option<Track> {
        self.items.pop_front()
    }

    /// Devuelve el track al frente sin sacarlo.
    pub fn front(&self) -> Option<&Track> {
        self.items.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut Track> {
        self.items.front_mut()
    }

    /// Reinserta un track al frente (loop de track).
    pub fn push_front(&mut self, track: Track) {
        self.items.push_front(track);
    }

    pub fn remove(&mut self, index: usize) -> Result<Track> {
        self.items
            .remove(index)
            .ok_or_else(|| Error::Validation(format!("índice fuera de rango: {index}")))
    }

    /// Mueve un track a una nueva posición.
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<()> {
        if from >= self.items.len() || to >= self.items.len() {
            return Err(Error::Validation("índice fuera de rango".into()));
        }
        if from != to {
            let track = self
                .items
                .remove(from)
                .ok_or_else(|| Error::Validation("no se pudo remover el track".into()))?;
            self.items.insert(to, track);
            debug!("📍 Track movido de posición {} a {}", from, to);
        }
        Ok(())
    }

    pub fn swap(&mut self, a: usize, b: usize) -> Result<()> {
        if a >= self.items.len() || b >= self.items.len() {
            return Err(Error::Validation("índice fuera de rango".into()));
        }
        self.items.swap(a, b);
        Ok(())
    }

    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    // Búsqueda

    /// Busca por substring en título o autor (case-insensitive).
    pub fn search(&self, term: &str) -> Vec<(usize, Track)> {
        let term = term.to_lowercase();
        self.items
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.info.title.to_lowercase().contains(&term)
                    || t.info.author.to_lowercase().contains(&term)
            })
            .map(|(i, t)| (i, t.clone()))
            .collect()
    }

    /// Busca por predicado arbitrario.
    pub fn find<F: Fn(&Track) -> bool>(&self, predicate: F) -> Vec<(usize, Track)> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, t)| predicate(t))
            .map(|(i, t)| (i, t.clone()))
            .collect()
    }

    /// Elimina los tracks que cumplen el predicado.
    pub fn remove_matching<F: Fn(&Track) -> bool>(&mut self, predicate: F) -> usize {
        let before = self.items.len();
        self.items.retain(|t| !predicate(t));
        before - self.items.len()
    }

    pub fn by_source(&self, source: &str) -> Vec<(usize, Track)> {
        let source = source.to_lowercase();
        self.find(|t| t.info.source_name.to_lowercase() == source)
    }

    pub fn by_author(&self, author: &str) -> Vec<(usize, Track)> {
        let author = author.to_lowercase();
        self.find(|t| t.info.author.to_lowercase().contains(&author))
    }

    pub fn by_title(&self, title: &str) -> Vec<(usize, Track)> {
        let title = title.to_lowercase();
        self.find(|t| t.info.title.to_lowercase().contains(&title))
    }

    /// Limpia duplicados por identificador/uri, conservando el primero.
    pub fn dedupe(&mut self) -> usize {
        let mut seen = HashSet::new();
        let before = self.items.len();
        self.items.retain(|t| {
            let key = if t.info.identifier.is_empty() {
                t.info.uri.clone()
            } else {
                t.info.identifier.clone()
            };
            seen.insert(key)
        });
        let removed = before - self.items.len();
        if removed > 0 {
            info!("🗑️ Eliminados {} duplicados de la cola", removed);
        }
        removed
    }

    /// Elimina los tracks pedidos por un usuario específico.
    pub fn remove_by_requester(&mut self, user_id: u64) -> usize {
        self.remove_matching(|t| {
            t.user_data
                .get("requester")
                .and_then(serde_json::Value::as_u64)
                == Some(user_id)
        })
    }

    // Shuffle

    /// Mezcla in-place (Fisher–Yates).
    pub fn shuffle(&mut self) {
        if self.items.len() <= 1 {
            return;
        }
        let mut items: Vec<Track> = self.items.drain(..).collect();
        items.shuffle(&mut rand::thread_rng());
        self.items.extend(items);
        info!("🔀 Cola mezclada ({} tracks)", self.items.len());
    }

    /// Mezcla priorizando lo que no sonó hace poco: los tracks cuyo
    /// identificador aparece en la ventana reciente del historial van
    /// al final, y cada partición se mezcla por separado.
    pub fn smart_shuffle(&mut self, recent_ids: &HashSet<String>) {
        if self.items.len() <= 1 {
            return;
        }
        let mut fresh = Vec::new();
        let mut recent = Vec::new();
        for track in self.items.drain(..) {
            if recent_ids.contains(&track.info.identifier) {
                recent.push(track);
            } else {
                fresh.push(track);
            }
        }
        let mut rng = rand::thread_rng();
        fresh.shuffle(&mut rng);
        recent.shuffle(&mut rng);
        let recent_count = recent.len();
        self.items.extend(fresh);
        self.items.extend(recent);
        info!("🔀 Smart shuffle aplicado ({} recientes al final)", recent_count);
    }

    /// Saca todos los tracks (para el shuffle asíncrono del player).
    pub fn take_all(&mut self) -> Vec<Track> {
        self.items.drain(..).collect()
    }

    /// Reinserta tracks al frente, antes de lo agregado entretanto.
    pub fn restore_front(&mut self, tracks: Vec<Track>) {
        for track in tracks.into_iter().rev() {
            self.items.push_front(track);
        }
    }

    // Stats y export

    pub fn stats(&self) -> QueueStats {
        let tracks = self.items.len();
        let total_duration_ms: u64 = self
            .items
            .iter()
            .filter(|t| !t.info.is_stream)
            .map(|t| t.info.length)
            .sum();
        let authors: HashSet<&str> = self.items.iter().map(|t| t.info.author.as_str()).collect();
        let sources: HashSet<&str> = self
            .items
            .iter()
            .map(|t| t.info.source_name.as_str())
            .collect();

        QueueStats {
            tracks,
            total_duration_ms,
            average_duration_ms: if tracks == 0 {
                0
            } else {
                total_duration_ms / tracks as u64
            },
            unique_authors: authors.len(),
            unique_sources: sources.len(),
        }
    }

    /// Snapshot plano de la cola, en orden.
    pub fn to_vec(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }

    /// Página de la cola para listados.
    pub fn page(&self, page: usize, per_page: usize) -> QueuePage {
        let safe_page = page.max(1);
        let start = (safe_page - 1) * per_page;
        let end = (start + per_page).min(self.items.len());
        let total_pages = if self.items.is_empty() {
            1
        } else {
            (self.items.len() + per_page - 1) / per_page
        };

        QueuePage {
            items: if start < self.items.len() {
                self.items.range(start..end).cloned().collect()
            } else {
                Vec::new()
            },
            current_page: safe_page,
            total_pages,
            total_items: self.items.len(),
        }
    }
}

/// Mezcla un vector de tracks cediendo el scheduler cada tanto, para
/// que una cola enorme no bloquee a los demás players.
pub async fn shuffle_tracks_async(tracks: &mut Vec<Track>) {
    const YIELD_EVERY: usize = 1_000;
    let mut rng = rand::thread_rng();
    for i in (1..tracks.len()).rev() {
        let j = rng.gen_range(0..=i);
        tracks.swap(i, j);
        if i % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
    }
}

/// Estadísticas agregadas de la cola.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub tracks: usize,
    pub total_duration_ms: u64,
    pub average_duration_ms: u64,
    pub unique_authors: usize,
    pub unique_sources: usize,
}

/// Una página del listado de la cola.
#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<Track>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TrackInfo;

    fn track(id: &str, title: &str, author: &str) -> Track {
        Track {
            encoded: Some(format!("enc-{id}")),
            info: TrackInfo {
                identifier: id.to_string(),
                title: title.to_string(),
                author: author.to_string(),
                length: 180_000,
                source_name: "youtube".to_string(),
                ..TrackInfo::default()
            },
            user_data: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_add_respeta_el_maximo() {
        let mut queue = TrackQueue::new(2);
        queue.add(track("1", "a", "x")).unwrap();
        queue.add(track("2", "b", "x")).unwrap();
        assert!(matches!(
            queue.add(track("3", "c", "x")),
            Err(Error::Validation(_))
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_add_many_corta_en_la_capacidad() {
        let mut queue = TrackQueue::new(3);
        let added = queue.add_many(vec![
            track("1", "a", "x"),
            track("2", "b", "x"),
            track("3", "c", "x"),
            track("4", "d", "x"),
        ]);
        assert_eq!(added, 3);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_mover_y_swap() {
        let mut queue = TrackQueue::new(10);
        for i in 0..4 {
            queue.add(track(&i.to_string(), &format!("t{i}"), "x")).unwrap();
        }
        queue.move_track(3, 0).unwrap();
        assert_eq!(queue.front().unwrap().info.identifier, "3");

        queue.swap(0, 1).unwrap();
        assert_eq!(queue.front().unwrap().info.identifier, "0");

        assert!(queue.move_track(0, 99).is_err());
        assert!(queue.swap(99, 0).is_err());
    }

    #[test]
    fn test_busqueda_por_titulo_y_autor() {
        let mut queue = TrackQueue::new(10);
        queue.add(track("1", "Bohemian Rhapsody", "Queen")).unwrap();
        queue.add(track("2", "Under Pressure", "Queen")).unwrap();
        queue.add(track("3", "Imagine", "John Lennon")).unwrap();

        assert_eq!(queue.search("queen").len(), 2);
        assert_eq!(queue.search("IMAGINE").len(), 1);
        assert_eq!(queue.by_author("lennon").len(), 1);
        assert!(queue.search("zeppelin").is_empty());
    }

    #[test]
    fn test_shuffle_conserva_el_multiset() {
        let mut queue = TrackQueue::new(100);
        for i in 0..50 {
            queue.add(track(&i.to_string(), &format!("t{i}"), "x")).unwrap();
        }
        let mut before: Vec<String> =
            queue.iter().map(|t| t.info.identifier.clone()).collect();
        queue.shuffle();
        let mut after: Vec<String> =
            queue.iter().map(|t| t.info.identifier.clone()).collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn test_shuffle_de_cola_corta_es_identidad() {
        let mut queue = TrackQueue::new(10);
        queue.add(track("solo", "t", "x")).unwrap();
        queue.shuffle();
        assert_eq!(queue.front().unwrap().info.identifier, "solo");

        let mut vacia = TrackQueue::new(10);
        vacia.shuffle();
        assert!(vacia.is_empty());
    }

    #[test]
    fn test_smart_shuffle_manda_recientes_al_final() {
        let mut queue = TrackQueue::new(100);
        for i in 0..20 {
            queue.add(track(&i.to_string(), &format!("t{i}"), "x")).unwrap();
        }
        let recent: HashSet<String> = ["3", "7", "11"].iter().map(|s| s.to_string()).collect();
        queue.smart_shuffle(&recent);

        let ids: Vec<String> = queue.iter().map(|t| t.info.identifier.clone()).collect();
        assert_eq!(ids.len(), 20);
        // Los tres recientes ocupan exactamente las últimas posiciones.
        for id in &ids[17..] {
            assert!(recent.contains(id), "{id} debería estar al final");
        }
        for id in &ids[..17] {
            assert!(!recent.contains(id));
        }
    }

    #[test]
    fn test_dedupe_conserva_el_primero() {
        let mut queue = TrackQueue::new(10);
        queue.add(track("a", "uno", "x")).unwrap();
        queue.add(track("b", "dos", "x")).unwrap();
        queue.add(track("a", "uno otra vez", "x")).unwrap();
        assert_eq!(queue.dedupe(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.front().unwrap().info.title, "uno");
    }

    #[test]
    fn test_remove_by_requester() {
        let mut queue = TrackQueue::new(10);
        let mut pedido = track("a", "uno", "x");
        pedido.user_data = serde_json::json!({ "requester": 42 });
        queue.add(pedido).unwrap();
        queue.add(track("b", "dos", "x")).unwrap();

        assert_eq!(queue.remove_by_requester(42), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remove_by_requester(42), 0);
    }

    #[test]
    fn test_stats() {
        let mut queue = TrackQueue::new(10);
        queue.add(track("1", "a", "Queen")).unwrap();
        queue.add(track("2", "b", "Queen")).unwrap();
        queue.add(track("3", "c", "Lennon")).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.tracks, 3);
        assert_eq!(stats.unique_authors, 2);
        assert_eq!(stats.unique_sources, 1);
        assert_eq!(stats.total_duration_ms, 540_000);
        assert_eq!(stats.average_duration_ms, 180_000);
    }

    #[test]
    fn test_paginacion() {
        let mut queue = TrackQueue::new(100);
        for i in 0..25 {
            queue.add(track(&i.to_string(), &format!("t{i}"), "x")).unwrap();
        }
        let pagina = queue.page(2, 10);
        assert_eq!(pagina.items.len(), 10);
        assert_eq!(pagina.total_pages, 3);
        assert_eq!(pagina.items[0].info.identifier, "10");

        let fuera = queue.page(99, 10);
        assert!(fuera.items.is_empty());
    }

    #[tokio::test]
    async fn test_shuffle_async_conserva_el_multiset() {
        let mut tracks: Vec<Track> = (0..2500)
            .map(|i| track(&i.to_string(), &format!("t{i}"), "x"))
            .collect();
        let mut before: Vec<String> = tracks.iter().map(|t| t.info.identifier.clone()).collect();
        shuffle_tracks_async(&mut tracks).await;
        let mut after: Vec<String> = tracks.iter().map(|t| t.info.identifier.clone()).collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn test_restore_front_mantiene_el_orden() {
        let mut queue = TrackQueue::new(10);
        queue.add(track("nuevo", "agregado durante shuffle", "x")).unwrap();
        queue.restore_front(vec![track("a", "1", "x"), track("b", "2", "x")]);
        let ids: Vec<String> = queue.iter().map(|t| t.info.identifier.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "nuevo"]);
    }
}
