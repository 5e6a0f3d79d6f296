use crate::extractor::{RawEncoding, VideoMetadata};

const CANDIDATE_HEIGHTS: [u32; 5] = [1080, 720, 480, 360, 240];
const BEST_RANK: u32 = 10_000;
const AUDIO_RANK: u32 = 1;

pub const BEST_SELECTOR: &str = "bestvideo+bestaudio/best";
pub const AUDIO_SELECTOR: &str = "bestaudio/best";

/// How the list of selectable profiles is derived from a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogPolicy {
    /// Offer a resolution only if the source has an encoding at that height.
    Probed,
    /// Offer the same ladder for every source.
    Fixed,
}

impl CatalogPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "probed" => Some(Self::Probed),
            "fixed" => Some(Self::Fixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatProfile {
    pub selector: String,
    pub label: String,
    pub description: String,
    pub quality: u32,
    pub ext: String,
    /// Largest size the extractor reported for the matching video stream.
    pub estimated_bytes: Option<u64>,
}

impl FormatProfile {
    fn new(selector: &str, label: &str, description: &str, quality: u32, ext: &str) -> Self {
        Self {
            selector: selector.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            quality,
            ext: ext.to_string(),
            estimated_bytes: None,
        }
    }

    pub fn is_audio_only(&self) -> bool {
        self.ext == "m4a" || self.ext == "mp3"
    }
}

/// Never returns an empty list.
pub fn build_catalog(metadata: &VideoMetadata, policy: CatalogPolicy) -> Vec<FormatProfile> {
    let mut profiles = match policy {
        CatalogPolicy::Probed => probed_profiles(&metadata.formats),
        CatalogPolicy::Fixed => fixed_profiles(),
    };

    // Stable sort keeps insertion order for equal ranks.
    profiles.sort_by(|a, b| b.quality.cmp(&a.quality));
    profiles
}

fn probed_profiles(encodings: &[RawEncoding]) -> Vec<FormatProfile> {
    let mut profiles = vec![FormatProfile::new(
        BEST_SELECTOR,
        "Mejor calidad",
        "Video + audio en la mejor calidad disponible",
        BEST_RANK,
        "mp4",
    )];

    for height in CANDIDATE_HEIGHTS {
        let matching: Vec<&RawEncoding> = encodings
            .iter()
            .filter(|encoding| encoding.has_video() && encoding.height == Some(height))
            .collect();
        if matching.is_empty() {
            continue;
        }
        let estimated_bytes = matching
            .iter()
            .filter_map(|encoding| encoding.filesize)
            .filter(|size| size.is_finite() && *size > 0.0)
            .map(|size| size as u64)
            .max();

        profiles.push(FormatProfile {
            selector: format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]"),
            label: height_label(height),
            description: format!("Video + audio hasta {height}p"),
            quality: height,
            ext: "mp4".to_string(),
            estimated_bytes,
        });
    }

    profiles.push(FormatProfile::new(
        AUDIO_SELECTOR,
        "Solo audio",
        "Pista de audio sin video",
        AUDIO_RANK,
        "m4a",
    ));
    profiles
}

fn fixed_profiles() -> Vec<FormatProfile> {
    vec![
        FormatProfile::new(
            "best[height<=720][filesize<50M]/best[height<=720]",
            "HD 720p (Recomendado)",
            "Video HD + audio (max. 50MB)",
            720,
            "mp4",
        ),
        FormatProfile::new(
            "best[height<=480][filesize<25M]/best[height<=480]",
            "SD 480p (Rapido)",
            "Descarga rapida (max. 25MB)",
            480,
            "mp4",
        ),
        FormatProfile::new(
            "best[height<=360][filesize<15M]/best[height<=360]",
            "360p (Liviano)",
            "Optimo para moviles (max. 15MB)",
            360,
            "mp4",
        ),
        FormatProfile::new(
            "bestaudio[filesize<10M]/bestaudio",
            "Solo audio",
            "Solo audio (max. 10MB)",
            AUDIO_RANK,
            "m4a",
        ),
    ]
}

fn height_label(height: u32) -> String {
    match height {
        1080 => "Full HD 1080p".to_string(),
        720 => "HD 720p".to_string(),
        480 => "SD 480p".to_string(),
        other => format!("{other}p"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoding(height: Option<u32>, vcodec: &str) -> RawEncoding {
        RawEncoding {
            height,
            vcodec: Some(vcodec.to_string()),
            filesize: None,
        }
    }

    fn metadata(formats: Vec<RawEncoding>) -> VideoMetadata {
        VideoMetadata {
            title: Some("Test Video".to_string()),
            duration: Some(125.0),
            thumbnail: None,
            formats,
        }
    }

    #[test]
    fn probed_catalog_offers_only_present_heights() {
        let catalog = build_catalog(
            &metadata(vec![
                encoding(Some(720), "avc1"),
                encoding(Some(360), "vp9"),
                encoding(Some(1080), "none"),
                encoding(Some(1440), "avc1"),
            ]),
            CatalogPolicy::Probed,
        );

        let labels: Vec<_> = catalog.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["Mejor calidad", "HD 720p", "360p", "Solo audio"]);
        assert_eq!(
            catalog[1].selector,
            "bestvideo[height<=720]+bestaudio/best[height<=720]"
        );
    }

    #[test]
    fn probed_heights_carry_largest_reported_size() {
        let mut small = encoding(Some(480), "avc1");
        small.filesize = Some(1_000.0);
        let mut large = encoding(Some(480), "vp9");
        large.filesize = Some(5_000.0);
        let catalog = build_catalog(&metadata(vec![small, large]), CatalogPolicy::Probed);

        assert_eq!(catalog[1].label, "SD 480p");
        assert_eq!(catalog[1].estimated_bytes, Some(5_000));
        assert_eq!(catalog[0].estimated_bytes, None);
    }

    #[test]
    fn probed_catalog_without_encodings_still_has_best_and_audio() {
        let catalog = build_catalog(&metadata(Vec::new()), CatalogPolicy::Probed);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].selector, BEST_SELECTOR);
        assert!(catalog[1].is_audio_only());
    }

    #[test]
    fn fixed_catalog_ignores_source() {
        let catalog = build_catalog(&metadata(vec![encoding(Some(1080), "avc1")]), CatalogPolicy::Fixed);
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog[0].quality, 720);
        assert_eq!(catalog[3].ext, "m4a");
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(CatalogPolicy::parse("Fixed"), Some(CatalogPolicy::Fixed));
        assert_eq!(CatalogPolicy::parse(" probed "), Some(CatalogPolicy::Probed));
        assert_eq!(CatalogPolicy::parse("other"), None);
    }
}
