//! Filtros de audio por player: primitivos, toggles derivados y
//! presets con nombre. El nodo no soporta parches parciales, así que
//! toda mutación marca el payload completo para el próximo flush.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Cantidad de bandas del ecualizador del nodo.
pub const EQ_BANDS: usize = 15;
/// Rango válido de ganancia por banda.
pub const EQ_GAIN_MIN: f32 = -0.25;
pub const EQ_GAIN_MAX: f32 = 1.0;

/// Una banda del ecualizador.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EqualizerBand {
    pub band: u8,
    pub gain: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Karaoke {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mono_level: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_band: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_width: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timescale {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Tremolo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Vibrato {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Rotation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_hz: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Distortion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sin_offset: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sin_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cos_offset: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cos_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tan_offset: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tan_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelMix {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_to_left: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_to_right: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_to_left: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_to_right: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LowPass {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoothing: Option<f32>,
}

/// Configuración de filtros de un player.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Filters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<EqualizerBand>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Karaoke>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Tremolo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<Vibrato>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distortion: Option<Distortion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_mix: Option<ChannelMix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPass>,

    // Toggles derivados; no viajan al nodo.
    #[serde(skip)]
    bassboost_level: f32,
    #[serde(skip)]
    nightcore: bool,
    #[serde(skip)]
    vaporwave: bool,
    #[serde(skip)]
    eight_d: bool,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    // Primitivos

    /// Reemplaza el ecualizador completo.
    pub fn set_equalizer(&mut self, bands: Vec<EqualizerBand>) -> Result<()> {
        for band in &bands {
            if band.band as usize >= EQ_BANDS {
                return Err(Error::Validation(format!(
                    "banda inválida: {} (máximo {})",
                    band.band,
                    EQ_BANDS - 1
                )));
            }
            if band.gain < EQ_GAIN_MIN || band.gain > EQ_GAIN_MAX {
                return Err(Error::Validation(format!(
                    "ganancia fuera de rango en banda {}: {}",
                    band.band, band.gain
                )));
            }
        }
        self.equalizer = if bands.is_empty() { None } else { Some(bands) };
        self.bassboost_level = 0.0;
        Ok(())
    }

    pub fn set_karaoke(&mut self, karaoke: Option<Karaoke>) {
        self.karaoke = karaoke;
    }

    pub fn set_timescale(&mut self, timescale: Option<Timescale>) -> Result<()> {
        if let Some(ts) = &timescale {
            for value in [ts.speed, ts.pitch, ts.rate].into_iter().flatten() {
                if value <= 0.0 {
                    return Err(Error::Validation(format!(
                        "timescale debe ser positivo, se recibió {value}"
                    )));
                }
            }
        }
        self.timescale = timescale;
        self.nightcore = false;
        self.vaporwave = false;
        Ok(())
    }

    pub fn set_tremolo(&mut self, tremolo: Option<Tremolo>) -> Result<()> {
        if let Some(t) = &tremolo {
            validate_wave(t.frequency, t.depth)?;
        }
        self.tremolo = tremolo;
        Ok(())
    }

    pub fn set_vibrato(&mut self, vibrato: Option<Vibrato>) -> Result<()> {
        if let Some(v) = &vibrato {
            validate_wave(v.frequency, v.depth)?;
        }
        self.vibrato = vibrato;
        Ok(())
    }

    pub fn set_rotation(&mut self, rotation: Option<Rotation>) {
        self.rotation = rotation;
        self.eight_d = false;
    }

    pub fn set_distortion(&mut self, distortion: Option<Distortion>) {
        self.distortion = distortion;
    }

    pub fn set_channel_mix(&mut self, mix: Option<ChannelMix>) -> Result<()> {
        if let Some(m) = &mix {
            for value in [m.left_to_left, m.left_to_right, m.right_to_left, m.right_to_right]
                .into_iter()
                .flatten()
            {
                if !(0.0..=1.0).contains(&value) {
                    return Err(Error::Validation(format!(
                        "channelMix fuera de [0, 1]: {value}"
                    )));
                }
            }
        }
        self.channel_mix = mix;
        Ok(())
    }

    pub fn set_low_pass(&mut self, low_pass: Option<LowPass>) -> Result<()> {
        if let Some(lp) = &low_pass {
            if let Some(s) = lp.smoothing {
                if s < 1.0 {
                    return Err(Error::Validation(format!(
                        "smoothing debe ser >= 1.0, se recibió {s}"
                    )));
                }
            }
        }
        self.low_pass = low_pass;
        Ok(())
    }

    // Derivados

    /// Bassboost en niveles 0..=5; 0 lo apaga. Todas las bandas quedan
    /// en `(v-1)·(1.25/9) - 0.25`.
    pub fn bassboost(&mut self, level: f32) -> Result<()> {
        if !(0.0..=5.0).contains(&level) {
            return Err(Error::Validation(format!(
                "bassboost fuera de [0, 5]: {level}"
            )));
        }
        if level == 0.0 {
            self.equalizer = None;
            self.bassboost_level = 0.0;
            return Ok(());
        }
        let gain = (level - 1.0) * (1.25 / 9.0) - 0.25;
        self.equalizer = Some(
            (0..EQ_BANDS as u8)
                .map(|band| EqualizerBand { band, gain })
                .collect(),
        );
        self.bassboost_level = level;
        Ok(())
    }

    /// Nightcore (rate 1.5). Excluyente con vaporwave.
    pub fn nightcore(&mut self, enabled: bool) {
        if enabled {
            self.timescale = Some(Timescale {
                rate: Some(1.5),
                ..Timescale::default()
            });
            self.nightcore = true;
            self.vaporwave = false;
        } else if self.nightcore {
            self.timescale = None;
            self.nightcore = false;
        }
    }

    /// Vaporwave (pitch 0.5). Excluyente con nightcore.
    pub fn vaporwave(&mut self, enabled: bool) {
        if enabled {
            self.timescale = Some(Timescale {
                pitch: Some(0.5),
                ..Timescale::default()
            });
            self.vaporwave = true;
            self.nightcore = false;
        } else if self.vaporwave {
            self.timescale = None;
            self.vaporwave = false;
        }
    }

    /// Audio 8D (rotación 0.2 Hz).
    pub fn eight_d(&mut self, enabled: bool) {
        if enabled {
            self.rotation = Some(Rotation {
                rotation_hz: Some(0.2),
            });
            self.eight_d = true;
        } else if self.eight_d {
            self.rotation = None;
            self.eight_d = false;
        }
    }

    pub fn is_bassboost(&self) -> bool {
        self.bassboost_level > 0.0
    }

    pub fn is_nightcore(&self) -> bool {
        self.nightcore
    }

    pub fn is_vaporwave(&self) -> bool {
        self.vaporwave
    }

    pub fn is_eight_d(&self) -> bool {
        self.eight_d
    }

    // Presets

    /// Aplica un preset con nombre: limpia lo vigente y aplica una
    /// combinación fija. Nombre desconocido es error de validación.
    pub fn apply_preset(&mut self, name: &str) -> Result<()> {
        let normalized = name.to_lowercase();
        self.clear();

        match normalized.as_str() {
            "flat" => {}
            "gaming" => {
                // Graves presentes y voces al frente, sin latencia extra.
                self.bassboost(2.0)?;
                self.set_channel_mix(Some(ChannelMix {
                    left_to_left: Some(0.9),
                    left_to_right: Some(0.1),
                    right_to_left: Some(0.1),
                    right_to_right: Some(0.9),
                }))?;
            }
            "lofi" => {
                self.set_low_pass(Some(LowPass {
                    smoothing: Some(8.0),
                }))?;
                self.set_timescale(Some(Timescale {
                    speed: Some(0.95),
                    ..Timescale::default()
                }))?;
            }
            "party" => {
                self.bassboost(3.0)?;
                self.set_tremolo(Some(Tremolo {
                    frequency: Some(4.0),
                    depth: Some(0.25),
                }))?;
            }
            "karaoke" => {
                self.set_karaoke(Some(Karaoke {
                    level: Some(1.0),
                    mono_level: Some(1.0),
                    filter_band: Some(220.0),
                    filter_width: Some(100.0),
                }));
            }
            "karaoke_soft" => {
                self.set_karaoke(Some(Karaoke {
                    level: Some(0.6),
                    mono_level: Some(1.0),
                    filter_band: Some(220.0),
                    filter_width: Some(100.0),
                }));
            }
            "nightcore" => self.nightcore(true),
            "vaporwave" => self.vaporwave(true),
            "8d" => self.eight_d(true),
            "bassboost" => self.bassboost(2.5)?,
            other => {
                return Err(Error::Validation(format!("preset desconocido: {other}")));
            }
        }

        info!("🎛️ Preset de filtros aplicado: {}", normalized);
        Ok(())
    }

    /// Nombres de preset aceptados por [`Filters::apply_preset`].
    pub fn preset_names() -> &'static [&'static str] {
        &[
            "flat", "gaming", "lofi", "party", "karaoke", "karaoke_soft", "nightcore",
            "vaporwave", "8d", "bassboost",
        ]
    }

    /// Limpia todos los filtros y toggles.
    pub fn clear(&mut self) {
        *self = Filters::default();
    }

    /// Hay algún filtro activo.
    pub fn is_active(&self) -> bool {
        self.equalizer.is_some()
            || self.karaoke.is_some()
            || self.timescale.is_some()
            || self.tremolo.is_some()
            || self.vibrato.is_some()
            || self.rotation.is_some()
            || self.distortion.is_some()
            || self.channel_mix.is_some()
            || self.low_pass.is_some()
    }

    /// Payload completo para `updatePlayer`; el contrato del nodo no
    /// acepta parches parciales de filtros.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn validate_wave(frequency: Option<f32>, depth: Option<f32>) -> Result<()> {
    if let Some(f) = frequency {
        if f <= 0.0 {
            return Err(Error::Validation(format!(
                "la frecuencia debe ser positiva, se recibió {f}"
            )));
        }
    }
    if let Some(d) = depth {
        if !(0.0..=1.0).contains(&d) {
            return Err(Error::Validation(format!("depth fuera de [0, 1]: {d}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bassboost_formula() {
        let mut filters = Filters::new();
        filters.bassboost(1.0).unwrap();
        let bands = filters.equalizer.as_ref().unwrap();
        assert_eq!(bands.len(), EQ_BANDS);
        // v=1 → ganancia -0.25 exacta
        assert!((bands[0].gain - (-0.25)).abs() < f32::EPSILON);

        filters.bassboost(5.0).unwrap();
        let gain = filters.equalizer.as_ref().unwrap()[7].gain;
        let esperado = 4.0 * (1.25 / 9.0) - 0.25;
        assert!((gain - esperado).abs() < 1e-6);
        assert!(gain <= EQ_GAIN_MAX);
    }

    #[test]
    fn test_bassboost_fuera_de_rango() {
        let mut filters = Filters::new();
        assert!(matches!(filters.bassboost(5.1), Err(Error::Validation(_))));
        assert!(matches!(filters.bassboost(-1.0), Err(Error::Validation(_))));
    }

    #[test]
    fn test_bassboost_cero_apaga() {
        let mut filters = Filters::new();
        filters.bassboost(3.0).unwrap();
        assert!(filters.is_bassboost());
        filters.bassboost(0.0).unwrap();
        assert!(!filters.is_bassboost());
        assert!(filters.equalizer.is_none());
    }

    #[test]
    fn test_nightcore_y_vaporwave_excluyentes() {
        let mut filters = Filters::new();
        filters.nightcore(true);
        assert!(filters.is_nightcore());
        assert_eq!(filters.timescale.as_ref().unwrap().rate, Some(1.5));

        filters.vaporwave(true);
        assert!(filters.is_vaporwave());
        assert!(!filters.is_nightcore());
        assert_eq!(filters.timescale.as_ref().unwrap().pitch, Some(0.5));
        assert_eq!(filters.timescale.as_ref().unwrap().rate, None);
    }

    #[test]
    fn test_equalizer_valida_bandas_y_ganancias() {
        let mut filters = Filters::new();
        assert!(filters
            .set_equalizer(vec![EqualizerBand { band: 15, gain: 0.0 }])
            .is_err());
        assert!(filters
            .set_equalizer(vec![EqualizerBand { band: 0, gain: 1.1 }])
            .is_err());
        assert!(filters
            .set_equalizer(vec![EqualizerBand { band: 0, gain: -0.3 }])
            .is_err());
        assert!(filters
            .set_equalizer(vec![EqualizerBand { band: 14, gain: 1.0 }])
            .is_ok());
    }

    #[test]
    fn test_preset_desconocido_es_validation() {
        let mut filters = Filters::new();
        assert!(matches!(
            filters.apply_preset("synthwave-extremo"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_preset_limpia_lo_anterior() {
        let mut filters = Filters::new();
        filters.eight_d(true);
        filters.apply_preset("lofi").unwrap();
        assert!(!filters.is_eight_d());
        assert!(filters.rotation.is_none());
        assert!(filters.low_pass.is_some());
    }

    #[test]
    fn test_payload_omite_los_vacios() {
        let mut filters = Filters::new();
        filters.nightcore(true);
        let payload = filters.payload();
        assert!(payload.get("timescale").is_some());
        assert!(payload.get("equalizer").is_none());
        assert!(payload.get("karaoke").is_none());
    }

    #[test]
    fn test_timescale_debe_ser_positivo() {
        let mut filters = Filters::new();
        let invalido = Timescale {
            speed: Some(0.0),
            ..Timescale::default()
        };
        assert!(filters.set_timescale(Some(invalido)).is_err());
    }

    #[test]
    fn test_todos_los_presets_aplican() {
        for name in Filters::preset_names() {
            let mut filters = Filters::new();
            filters.apply_preset(name).unwrap_or_else(|e| {
                panic!("preset {name} falló: {e}");
            });
        }
    }
}
