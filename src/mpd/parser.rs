//! MPD XML parsing, grounded on `dash_player::mpd::parser::parse_mpd`
//! (quick-xml pull parser) and extended to resolve the segment timeline into
//! a concrete `Vec<Segment>` per representation.

use crate::error::ManifestError;
use crate::models::{AdaptationSet, ManifestType, Mpd, Representation, Segment};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

#[derive(Default, Clone)]
struct TemplateAttrs {
    initialization: Option<String>,
    media: Option<String>,
    duration: Option<u64>,
    timescale: Option<u64>,
    start_number: Option<u64>,
}

impl TemplateAttrs {
    fn merge(base: &TemplateAttrs, over: &TemplateAttrs) -> TemplateAttrs {
        TemplateAttrs {
            initialization: over.initialization.clone().or_else(|| base.initialization.clone()),
            media: over.media.clone().or_else(|| base.media.clone()),
            duration: over.duration.or(base.duration),
            timescale: over.timescale.or(base.timescale),
            start_number: over.start_number.or(base.start_number),
        }
    }
}

struct TimelineEntry {
    start: u64,
    duration: u64,
}

fn expand_timeline(entries: &[(u64, u64, u64)]) -> Vec<TimelineEntry> {
    // (t, d, r) triples -> flattened (start, duration) entries, following
    // MPEG-DASH's SegmentTimeline semantics: r repeats the same duration,
    // with -1 meaning "repeat until the next explicit `t`" which we treat
    // (absent a next entry) as zero additional repeats — a manifest that
    // relies on open-ended `r="-1"` on the final entry is a live edge case
    // outside this emulator's scope.
    let mut out = Vec::new();
    let mut cursor = 0u64;
    for &(t, d, r) in entries {
        let start = if t != u64::MAX { t } else { cursor };
        let repeats = if r == u64::MAX { 0 } else { r };
        let mut s = start;
        for _ in 0..=repeats {
            out.push(TimelineEntry { start: s, duration: d });
            s += d;
        }
        cursor = s;
    }
    out
}

fn replace_number_format(template: &str, number: u64) -> String {
    let re = regex::Regex::new(r"\$Number(?:%0(\d+)d)?\$").unwrap();
    re.replace_all(template, |caps: &regex::Captures| {
        if let Some(width) = caps.get(1) {
            let width: usize = width.as_str().parse().unwrap_or(1);
            format!("{:0width$}", number, width = width)
        } else {
            number.to_string()
        }
    })
    .to_string()
}

fn resolve_url(template: &str, rep_id: &str, number: Option<u64>, time: Option<u64>) -> String {
    let mut out = template.replace("$RepresentationID$", rep_id);
    if let Some(n) = number {
        out = replace_number_format(&out, n);
    }
    if let Some(t) = time {
        out = out.replace("$Time$", &t.to_string());
    }
    out
}

struct RawRepresentation {
    id: String,
    bandwidth: u64,
    own_template: TemplateAttrs,
    timeline: Option<Vec<(u64, u64, u64)>>,
}

struct RawAdaptationSet {
    content_type: String,
    template: TemplateAttrs,
    timeline: Option<Vec<(u64, u64, u64)>>,
    representations: Vec<RawRepresentation>,
}

/// A cap on synthesized segments for representations addressed purely by
/// `$Number$`/duration without an explicit duration bound (dynamic
/// manifests, or static manifests missing `mediaPresentationDuration`).
/// Documented open-question resolution: see DESIGN.md.
const UNBOUNDED_SEGMENT_CAP: u64 = 100_000;

pub fn parse_mpd(xml: &str) -> Result<Mpd, ManifestError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut manifest_type = ManifestType::Static;
    let mut minimum_update_period: Option<f64> = None;
    let mut media_presentation_duration: Option<f64> = None;

    let mut adaptation_sets: Vec<RawAdaptationSet> = Vec::new();
    let mut current_adaptation: Option<RawAdaptationSet> = None;
    let mut current_rep: Option<RawRepresentation> = None;
    let mut pending_timeline: Vec<(u64, u64, u64)> = Vec::new();
    let mut inside_rep = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ManifestError::Parse(e.to_string()))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = e.name().to_owned();
                let tag = std::str::from_utf8(name.as_ref()).map_err(|e| ManifestError::Parse(e.to_string()))?;
                match tag {
                    "MPD" => {
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| ManifestError::Parse(e.to_string()))?;
                            let value = attr.unescape_value().map_err(|e| ManifestError::Parse(e.to_string()))?;
                            match attr.key.as_ref() {
                                b"type" => {
                                    manifest_type = if value.as_ref() == "dynamic" {
                                        ManifestType::Dynamic
                                    } else {
                                        ManifestType::Static
                                    };
                                }
                                b"minimumUpdatePeriod" => {
                                    minimum_update_period = parse_duration(&value);
                                }
                                b"mediaPresentationDuration" => {
                                    media_presentation_duration = parse_duration(&value);
                                }
                                _ => {}
                            }
                        }
                    }
                    "AdaptationSet" => {
                        let mut mime = String::new();
                        let mut content = String::new();
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| ManifestError::Parse(e.to_string()))?;
                            match attr.key.as_ref() {
                                b"mimeType" => mime = attr.unescape_value().unwrap_or_default().to_string(),
                                b"contentType" => content = attr.unescape_value().unwrap_or_default().to_string(),
                                _ => {}
                            }
                        }
                        let content_type = if !content.is_empty() {
                            content
                        } else if mime.contains("audio") {
                            "audio".to_string()
                        } else {
                            "video".to_string()
                        };
                        current_adaptation = Some(RawAdaptationSet {
                            content_type,
                            template: TemplateAttrs::default(),
                            timeline: None,
                            representations: Vec::new(),
                        });
                    }
                    "Representation" => {
                        inside_rep = true;
                        let mut id = String::new();
                        let mut bandwidth = 0u64;
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| ManifestError::Parse(e.to_string()))?;
                            match attr.key.as_ref() {
                                b"id" => id = attr.unescape_value().unwrap_or_default().to_string(),
                                b"bandwidth" => {
                                    bandwidth = attr
                                        .unescape_value()
                                        .ok()
                                        .and_then(|v| v.parse::<u64>().ok())
                                        .unwrap_or(0)
                                }
                                _ => {}
                            }
                        }
                        current_rep = Some(RawRepresentation {
                            id,
                            bandwidth,
                            own_template: TemplateAttrs::default(),
                            timeline: None,
                        });
                    }
                    "SegmentTemplate" => {
                        let mut t = TemplateAttrs::default();
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| ManifestError::Parse(e.to_string()))?;
                            let value = attr.unescape_value().unwrap_or_default().to_string();
                            match attr.key.as_ref() {
                                b"initialization" => t.initialization = Some(value),
                                b"media" => t.media = Some(value),
                                b"duration" => t.duration = value.parse().ok(),
                                b"timescale" => t.timescale = value.parse().ok(),
                                b"startNumber" => t.start_number = value.parse().ok(),
                                _ => {}
                            }
                        }
                        if inside_rep {
                            if let Some(rep) = current_rep.as_mut() {
                                rep.own_template = t;
                            }
                        } else if let Some(a) = current_adaptation.as_mut() {
                            a.template = t;
                        }
                    }
                    "SegmentTimeline" => {
                        pending_timeline.clear();
                    }
                    "S" => {
                        let mut t = u64::MAX;
                        let mut d = 0u64;
                        let mut r = u64::MAX;
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| ManifestError::Parse(e.to_string()))?;
                            let value = attr.unescape_value().unwrap_or_default();
                            match attr.key.as_ref() {
                                b"t" => t = value.parse().unwrap_or(u64::MAX),
                                b"d" => d = value.parse().unwrap_or(0),
                                b"r" => r = value.parse().unwrap_or(u64::MAX),
                                _ => {}
                            }
                        }
                        pending_timeline.push((t, d, r));
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => {
                let name = e.name().to_owned();
                let tag = std::str::from_utf8(name.as_ref()).map_err(|e| ManifestError::Parse(e.to_string()))?;
                match tag {
                    "SegmentTimeline" => {
                        let timeline = std::mem::take(&mut pending_timeline);
                        if inside_rep {
                            if let Some(rep) = current_rep.as_mut() {
                                rep.timeline = Some(timeline);
                            }
                        } else if let Some(a) = current_adaptation.as_mut() {
                            a.timeline = Some(timeline);
                        }
                    }
                    "Representation" => {
                        inside_rep = false;
                        if let Some(rep) = current_rep.take() {
                            if let Some(a) = current_adaptation.as_mut() {
                                a.representations.push(rep);
                            }
                        }
                    }
                    "AdaptationSet" => {
                        if let Some(a) = current_adaptation.take() {
                            adaptation_sets.push(a);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if adaptation_sets.is_empty() {
        return Err(ManifestError::Empty);
    }

    let mut resolved: HashMap<u64, AdaptationSet> = HashMap::new();
    for (as_index, raw) in adaptation_sets.into_iter().enumerate() {
        let mut representations = HashMap::new();
        for rep in raw.representations {
            let merged = TemplateAttrs::merge(&raw.template, &rep.own_template);
            let timeline = rep.timeline.or_else(|| raw.timeline.clone());
            let representation = resolve_representation(
                &rep.id,
                rep.bandwidth,
                &merged,
                timeline,
                media_presentation_duration,
            )?;
            representations.insert(rep.id, representation);
        }
        resolved.insert(
            as_index as u64,
            AdaptationSet {
                id: as_index as u64,
                content_type: raw.content_type,
                representations,
            },
        );
    }

    Ok(Mpd {
        manifest_type,
        minimum_update_period,
        adaptation_sets: resolved,
    })
}

fn resolve_representation(
    id: &str,
    bandwidth: u64,
    template: &TemplateAttrs,
    timeline: Option<Vec<(u64, u64, u64)>>,
    media_presentation_duration: Option<f64>,
) -> Result<Representation, ManifestError> {
    let media = template.media.clone().unwrap_or_default();
    let init_template = template.initialization.clone().unwrap_or_default();
    let initialization_url = init_template.replace("$RepresentationID$", id);
    let timescale = template.timescale.unwrap_or(1).max(1);
    let start_number = template.start_number.unwrap_or(1);

    let segments = if let Some(raw_timeline) = timeline {
        let entries = expand_timeline(&raw_timeline);
        entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| Segment {
                index: i as u64,
                url: resolve_url(&media, id, None, Some(entry.start)),
                duration: entry.duration as f64 / timescale as f64,
            })
            .collect::<Vec<_>>()
    } else if let Some(duration) = template.duration {
        let segment_duration = duration as f64 / timescale as f64;
        let count = media_presentation_duration
            .map(|total| (total / segment_duration).ceil() as u64)
            .unwrap_or(UNBOUNDED_SEGMENT_CAP)
            .max(1);
        (0..count)
            .map(|i| Segment {
                index: i,
                url: resolve_url(&media, id, Some(start_number + i), None),
                duration: segment_duration,
            })
            .collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(Representation {
        id: id.to_string(),
        bandwidth,
        initialization_url,
        segments,
    })
}

fn parse_duration(value: &str) -> Option<f64> {
    iso8601_duration::Duration::parse(value)
        .ok()
        .and_then(|d| d.to_std())
        .map(|d| d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<MPD type="static" mediaPresentationDuration="PT20S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate initialization="init-$RepresentationID$.m4s"
                        media="chunk-$RepresentationID$-$Number%05d$.m4s"
                        duration="4" timescale="1" startNumber="1"/>
      <Representation id="v0" bandwidth="500000"/>
      <Representation id="v1" bandwidth="2000000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn parses_number_addressed_segments() {
        let mpd = parse_mpd(SAMPLE).unwrap();
        assert_eq!(mpd.manifest_type, ManifestType::Static);
        let set = mpd.adaptation_sets.get(&0).unwrap();
        let rep = set.representation("v0").unwrap();
        assert_eq!(rep.segments.len(), 5); // 20s / 4s
        assert_eq!(rep.segments[0].url, "chunk-v0-00001.m4s");
        assert_eq!(rep.segments[4].url, "chunk-v0-00005.m4s");
        assert_eq!(rep.initialization_url, "init-v0.m4s");
        assert!((rep.segments[0].duration - 4.0).abs() < 1e-9);
    }

    #[test]
    fn parses_segment_timeline() {
        let xml = r#"<MPD type="dynamic">
  <Period>
    <AdaptationSet contentType="video">
      <Representation id="v0" bandwidth="100000">
        <SegmentTemplate initialization="init.m4s" media="seg-$Time$.m4s" timescale="1000">
          <SegmentTimeline>
            <S t="0" d="4000" r="2"/>
            <S d="2000"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let mpd = parse_mpd(xml).unwrap();
        assert_eq!(mpd.manifest_type, ManifestType::Dynamic);
        let set = mpd.adaptation_sets.get(&0).unwrap();
        let rep = set.representation("v0").unwrap();
        assert_eq!(rep.segments.len(), 4);
        assert_eq!(rep.segments[0].url, "seg-0.m4s");
        assert_eq!(rep.segments[1].url, "seg-4000.m4s");
        assert_eq!(rep.segments[3].url, "seg-12000.m4s");
        assert!((rep.segments[3].duration - 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_manifest_is_an_error() {
        let xml = r#"<MPD type="static"></MPD>"#;
        assert!(matches!(parse_mpd(xml), Err(ManifestError::Empty)));
    }
}
