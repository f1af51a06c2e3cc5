use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::ApiError;
use crate::models::DownloadType;
use crate::probe::StreamDescriptor;

/// One concrete, orderable attempt to satisfy a download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateStrategy {
    pub format_spec: String,
    pub merge_needed: bool,
    pub description: String,
}

impl CandidateStrategy {
    fn new(format_spec: impl Into<String>, merge_needed: bool, description: impl Into<String>) -> Self {
        Self {
            format_spec: format_spec.into(),
            merge_needed,
            description: description.into(),
        }
    }
}

/// Container families and the audio extensions/codecs that mux into them
/// without re-encoding.
const AUDIO_PAIRING_RULES: &[(&str, &[&str])] = &[
    ("webm", &["webm", "opus", "vorbis"]),
    ("mp4", &["m4a", "mp4", "aac", "mp4a"]),
];

fn container_family(ext: &str) -> Option<&'static str> {
    match ext {
        "webm" | "mkv" => Some("webm"),
        "mp4" | "m4v" | "mov" | "m4a" => Some("mp4"),
        _ => None,
    }
}

fn audio_matches_family(audio: &StreamDescriptor, family: &str) -> bool {
    let Some((_, partners)) = AUDIO_PAIRING_RULES.iter().find(|(name, _)| *name == family) else {
        return false;
    };
    let codec = audio.acodec.as_deref().unwrap_or_default();
    partners
        .iter()
        .any(|partner| audio.ext == *partner || codec.starts_with(partner))
}

/// Produces the ordered candidate chain for a download request.
///
/// The chain is consumed greedily by the fetch engine: candidates are tried
/// in emitted order and the first success wins.
pub fn resolve_candidates(
    format_id: &str,
    download_type: DownloadType,
    formats: &[StreamDescriptor],
) -> Result<Vec<CandidateStrategy>, ApiError> {
    if formats.is_empty() {
        return Err(ApiError::bad_request(
            "The source reported no downloadable streams.",
        ));
    }

    let candidates = match download_type {
        DownloadType::Audio => audio_candidates(format_id),
        DownloadType::Video => video_candidates(format_id, formats),
    };

    Ok(dedupe_by_spec(candidates))
}

fn audio_candidates(format_id: &str) -> Vec<CandidateStrategy> {
    vec![
        CandidateStrategy::new(format_id, false, "requested audio format"),
        CandidateStrategy::new("bestaudio", false, "best available audio"),
        CandidateStrategy::new("bestaudio[ext=m4a]", false, "best m4a audio"),
        CandidateStrategy::new("bestaudio/best", false, "any best audio"),
    ]
}

fn video_candidates(format_id: &str, formats: &[StreamDescriptor]) -> Vec<CandidateStrategy> {
    // A requested id that names a pre-muxed stream bypasses merge logic
    // entirely: sources that always embed audio need no pairing.
    if let Some(requested) = formats.iter().find(|f| f.id == format_id)
        && requested.is_premuxed()
    {
        return vec![CandidateStrategy::new(
            format_id,
            false,
            format!("requested pre-muxed stream ({})", quality_label(requested)),
        )];
    }

    // Composite "V+A" ids whose full id is not a known pre-muxed stream fall
    // through to the pairing branch driven by the video half.
    let video_id = format_id.split('+').next().unwrap_or(format_id);
    let video = formats.iter().find(|f| f.id == video_id);

    let mut candidates = Vec::new();

    if let Some(video) = video
        && let Some(family) = container_family(&video.ext)
        && let Some(partner) = best_audio_partner(formats, family)
    {
        candidates.push(CandidateStrategy::new(
            format!("{video_id}+{}", partner.id),
            true,
            format!("requested video paired with compatible {} audio", partner.ext),
        ));
    }

    candidates.push(CandidateStrategy::new(
        format!("{video_id}+bestaudio"),
        true,
        "requested video paired with best available audio",
    ));

    for premuxed in premuxed_fallbacks(formats) {
        candidates.push(CandidateStrategy::new(
            premuxed.id.clone(),
            false,
            format!("pre-muxed fallback ({})", quality_label(premuxed)),
        ));
    }

    candidates.push(CandidateStrategy::new(
        "best",
        false,
        "best available pre-muxed stream",
    ));

    candidates
}

/// Best compatible audio-only partner for a container family: highest audio
/// bitrate wins, known filesize breaks remaining ties.
fn best_audio_partner<'a>(
    formats: &'a [StreamDescriptor],
    family: &str,
) -> Option<&'a StreamDescriptor> {
    formats
        .iter()
        .filter(|f| f.is_audio_only() && audio_matches_family(f, family))
        .max_by(|a, b| compare_audio(a, b))
}

fn compare_audio(a: &StreamDescriptor, b: &StreamDescriptor) -> Ordering {
    let a_rate = a.abr.or(a.tbr).unwrap_or(0.0);
    let b_rate = b.abr.or(b.tbr).unwrap_or(0.0);
    a_rate
        .partial_cmp(&b_rate)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.filesize.is_some().cmp(&b.filesize.is_some()))
}

/// Pre-muxed streams ordered by descending target resolution.
fn premuxed_fallbacks(formats: &[StreamDescriptor]) -> Vec<&StreamDescriptor> {
    let mut premuxed: Vec<&StreamDescriptor> =
        formats.iter().filter(|f| f.is_premuxed()).collect();
    premuxed.sort_by(|a, b| compare_quality(a, b));
    premuxed
}

/// Ranking used both for fallback ordering and for the analyze listing.
///
/// Higher resolution first; at equal displayed resolution an entry with
/// embedded audio beats one that would need a merge, a known filesize beats
/// an unknown one, and the highest bitrate wins as the final deterministic
/// tie-break.
pub fn compare_quality(a: &StreamDescriptor, b: &StreamDescriptor) -> Ordering {
    b.height
        .unwrap_or(0)
        .cmp(&a.height.unwrap_or(0))
        .then_with(|| b.has_audio().cmp(&a.has_audio()))
        .then_with(|| b.filesize.is_some().cmp(&a.filesize.is_some()))
        .then_with(|| {
            b.tbr
                .unwrap_or(0.0)
                .partial_cmp(&a.tbr.unwrap_or(0.0))
                .unwrap_or(Ordering::Equal)
        })
}

pub fn quality_label(descriptor: &StreamDescriptor) -> String {
    match descriptor.height {
        Some(height) => {
            let mut label = format!("{height}p");
            if let Some(fps) = descriptor.fps
                && fps > 30.0
            {
                label.push_str(&format!(" {}fps", fps.round() as u32));
            }
            label
        }
        None => "Audio".to_string(),
    }
}

fn dedupe_by_spec(candidates: Vec<CandidateStrategy>) -> Vec<CandidateStrategy> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.format_spec.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(
        id: &str,
        ext: &str,
        vcodec: Option<&str>,
        acodec: Option<&str>,
        height: Option<u32>,
    ) -> StreamDescriptor {
        StreamDescriptor {
            id: id.to_string(),
            ext: ext.to_string(),
            vcodec: vcodec.map(ToString::to_string),
            acodec: acodec.map(ToString::to_string),
            height,
            width: None,
            fps: None,
            tbr: None,
            abr: None,
            filesize: None,
        }
    }

    fn sample_formats() -> Vec<StreamDescriptor> {
        let mut opus = descriptor("251", "webm", None, Some("opus"), None);
        opus.abr = Some(160.0);
        let mut m4a = descriptor("140", "m4a", None, Some("mp4a.40.2"), None);
        m4a.abr = Some(128.0);
        let mut low_opus = descriptor("250", "webm", None, Some("opus"), None);
        low_opus.abr = Some(70.0);

        vec![
            descriptor("137", "mp4", Some("avc1"), None, Some(1080)),
            descriptor("248", "webm", Some("vp9"), None, Some(1080)),
            descriptor("22", "mp4", Some("avc1"), Some("mp4a.40.2"), Some(720)),
            descriptor("18", "mp4", Some("avc1"), Some("mp4a.40.2"), Some(360)),
            opus,
            m4a,
            low_opus,
        ]
    }

    #[test]
    fn empty_descriptor_list_is_a_resolution_failure() {
        let result = resolve_candidates("137", DownloadType::Video, &[]);
        assert!(result.is_err());
    }

    #[test]
    fn non_empty_list_always_yields_candidates() {
        let formats = sample_formats();
        for id in ["137", "22", "nonexistent", "137+140"] {
            let candidates = resolve_candidates(id, DownloadType::Video, &formats).unwrap();
            assert!(!candidates.is_empty(), "no candidates for {id}");
        }
        let audio = resolve_candidates("140", DownloadType::Audio, &formats).unwrap();
        assert!(!audio.is_empty());
    }

    #[test]
    fn premuxed_request_is_the_only_candidate() {
        let formats = sample_formats();
        let candidates = resolve_candidates("22", DownloadType::Video, &formats).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].format_spec, "22");
        assert!(!candidates[0].merge_needed);
    }

    #[test]
    fn mp4_video_pairs_with_m4a_audio_first() {
        let formats = sample_formats();
        let candidates = resolve_candidates("137", DownloadType::Video, &formats).unwrap();
        assert_eq!(candidates[0].format_spec, "137+140");
        assert!(candidates[0].merge_needed);
        assert_eq!(candidates[1].format_spec, "137+bestaudio");
    }

    #[test]
    fn webm_video_pairs_with_best_opus_audio() {
        let formats = sample_formats();
        let candidates = resolve_candidates("248", DownloadType::Video, &formats).unwrap();
        // 251 (160 kbps) must beat 250 (70 kbps).
        assert_eq!(candidates[0].format_spec, "248+251");
    }

    #[test]
    fn fallback_chain_descends_and_ends_in_best() {
        let formats = sample_formats();
        let candidates = resolve_candidates("137", DownloadType::Video, &formats).unwrap();
        let specs: Vec<&str> = candidates.iter().map(|c| c.format_spec.as_str()).collect();
        assert_eq!(specs, vec!["137+140", "137+bestaudio", "22", "18", "best"]);
    }

    #[test]
    fn unknown_video_id_still_produces_a_chain() {
        let formats = sample_formats();
        let candidates = resolve_candidates("999", DownloadType::Video, &formats).unwrap();
        assert_eq!(candidates[0].format_spec, "999+bestaudio");
        assert_eq!(candidates.last().unwrap().format_spec, "best");
    }

    #[test]
    fn composite_id_falls_through_to_pairing() {
        let formats = sample_formats();
        let candidates = resolve_candidates("137+251", DownloadType::Video, &formats).unwrap();
        // Full id is not a known pre-muxed stream; the video half drives pairing.
        assert_eq!(candidates[0].format_spec, "137+140");
        assert!(candidates.iter().all(|c| c.format_spec != "137+251+bestaudio"));
    }

    #[test]
    fn audio_chain_relaxes_progressively() {
        let formats = sample_formats();
        let candidates = resolve_candidates("140", DownloadType::Audio, &formats).unwrap();
        let specs: Vec<&str> = candidates.iter().map(|c| c.format_spec.as_str()).collect();
        assert_eq!(
            specs,
            vec!["140", "bestaudio", "bestaudio[ext=m4a]", "bestaudio/best"]
        );
    }

    #[test]
    fn audio_chain_dedupes_requested_bestaudio() {
        let formats = sample_formats();
        let candidates = resolve_candidates("bestaudio", DownloadType::Audio, &formats).unwrap();
        let specs: Vec<&str> = candidates.iter().map(|c| c.format_spec.as_str()).collect();
        assert_eq!(specs, vec!["bestaudio", "bestaudio[ext=m4a]", "bestaudio/best"]);
    }

    #[test]
    fn equal_height_prefers_embedded_audio_then_filesize() {
        let with_audio = descriptor("a", "mp4", Some("avc1"), Some("mp4a"), Some(720));
        let video_only = descriptor("b", "mp4", Some("avc1"), None, Some(720));
        assert_eq!(compare_quality(&with_audio, &video_only), Ordering::Less);

        let mut sized = descriptor("c", "mp4", Some("avc1"), Some("mp4a"), Some(720));
        sized.filesize = Some(1000.0);
        let r#unsized = descriptor("d", "mp4", Some("avc1"), Some("mp4a"), Some(720));
        assert_eq!(compare_quality(&sized, &r#unsized), Ordering::Less);
    }

    #[test]
    fn equal_everything_highest_bitrate_wins() {
        let mut fast = descriptor("a", "mp4", Some("avc1"), Some("mp4a"), Some(720));
        fast.tbr = Some(4000.0);
        let mut slow = descriptor("b", "mp4", Some("avc1"), Some("mp4a"), Some(720));
        slow.tbr = Some(2000.0);
        assert_eq!(compare_quality(&fast, &slow), Ordering::Less);
    }

    #[test]
    fn quality_labels() {
        let mut hfr = descriptor("a", "mp4", Some("avc1"), None, Some(1080));
        hfr.fps = Some(60.0);
        assert_eq!(quality_label(&hfr), "1080p 60fps");

        let sdr = descriptor("b", "mp4", Some("avc1"), None, Some(480));
        assert_eq!(quality_label(&sdr), "480p");
    }
}
