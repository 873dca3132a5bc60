//! Audio assembly: MP3 merging, chapter marks and ID3 tags.
//!
//! Segments arrive in part order. They are either kept as separate files
//! (one tagged track per part) or merged into one stream with a chapter mark
//! at the start of every part. A segment that is not valid MPEG audio aborts
//! the whole artifact; nothing is left at the destination.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use id3::{
    Tag, TagLike, Version,
    frame::{Chapter, Comment, Picture, PictureType, TableOfContents},
};

use crate::{Error, Res, package::PublicationMetadata, utils};

/// One downloaded part of an audiobook.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    pub path: PathBuf,
    /// Chapter label for this part.
    pub title: Option<String>,
    /// Playing time as announced by the service.
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterMark {
    pub title: String,
    pub start: Duration,
    pub end: Duration,
}

#[derive(Debug, Clone)]
pub struct CoverImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Tag values of one audio file.
#[derive(Debug, Clone, Default)]
pub struct AudioTags {
    pub title: String,
    pub subtitle: Option<String>,
    pub album: String,
    pub artists: Vec<String>,
    pub narrators: Vec<String>,
    pub description: Option<String>,
    pub publisher: Option<String>,
    pub series: Option<String>,
    pub language: Option<String>,
    pub year: Option<i32>,
    pub track: Option<(u32, u32)>,
    pub chapters: Vec<ChapterMark>,
    pub cover: Option<CoverImage>,
}

impl AudioTags {
    /// Tags for the whole title, taken from the publication metadata.
    pub fn from_metadata(meta: &PublicationMetadata) -> Self {
        let series = meta.series.as_ref().map(|s| match &meta.series_index {
            Some(i) => format!("{s} #{i}"),
            None => s.clone(),
        });
        Self {
            title: meta.title.clone(),
            subtitle: meta.subtitle.clone(),
            album: meta.title.clone(),
            artists: meta.authors().into_iter().map(str::to_string).collect(),
            narrators: meta.narrators().into_iter().map(str::to_string).collect(),
            description: meta.description.clone(),
            publisher: meta.publisher.clone(),
            series,
            language: Some(meta.language.clone()),
            year: meta
                .published
                .as_deref()
                .and_then(|p| p.get(..4))
                .and_then(|y| y.parse().ok()),
            track: None,
            chapters: Vec::new(),
            cover: None,
        }
    }
}

/// Concatenates audio segments.
pub trait AudioMerger: Send + Sync {
    /// Playing time of one segment. Fails if the segment is not valid audio.
    fn probe(&self, segment: &Path) -> Res<Duration>;

    /// Writes the segments, in order, as one stream to `dest` and returns
    /// the measured duration of every segment.
    fn merge(&self, segments: &[PathBuf], dest: &Path) -> Res<Vec<Duration>>;
}

/// Writes tags into an audio file.
pub trait AudioTagger: Send + Sync {
    fn write_tags(&self, path: &Path, tags: &AudioTags) -> Res<()>;
}

/// Frame-level MP3 concatenation.
///
/// ID3v2 and ID3v1 tags of the inputs are dropped, the remaining MPEG frames
/// are copied verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mp3Concat;

impl Mp3Concat {
    fn read_frames(path: &Path) -> Res<(Vec<u8>, Duration)> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        let audio = strip_tags(&bytes);
        let scan = scan_frames(audio).map_err(|reason| {
            Error::Audio(format!("{} is not valid MP3: {reason}", path.display()))
        })?;
        Ok((audio[..scan.length].to_vec(), scan.duration))
    }
}

impl AudioMerger for Mp3Concat {
    fn probe(&self, segment: &Path) -> Res<Duration> {
        Self::read_frames(segment).map(|(_, d)| d)
    }

    fn merge(&self, segments: &[PathBuf], dest: &Path) -> Res<Vec<Duration>> {
        if segments.is_empty() {
            return Err(Error::Audio("nothing to merge".into()));
        }
        let file = File::create(dest).map_err(|e| Error::io(dest, e))?;
        let mut out = BufWriter::new(file);
        let mut durations = Vec::with_capacity(segments.len());
        for segment in segments {
            let (frames, duration) = Self::read_frames(segment)?;
            out.write_all(&frames).map_err(|e| Error::io(dest, e))?;
            durations.push(duration);
        }
        out.flush().map_err(|e| Error::io(dest, e))?;
        Ok(durations)
    }
}

/// ID3v2.4 tagger with CHAP/CTOC chapter frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct Id3Tagger;

impl AudioTagger for Id3Tagger {
    fn write_tags(&self, path: &Path, tags: &AudioTags) -> Res<()> {
        let mut tag = Tag::new();
        tag.set_title(&tags.title);
        tag.set_album(&tags.album);
        if !tags.artists.is_empty() {
            let artists = tags.artists.join(", ");
            tag.set_artist(&artists);
            tag.set_album_artist(&artists);
        }
        if !tags.narrators.is_empty() {
            tag.set_text("TCOM", tags.narrators.join(", "));
        }
        if let Some(subtitle) = &tags.subtitle {
            tag.set_text("TIT3", subtitle);
        }
        if let Some(series) = &tags.series {
            tag.set_text("TIT1", series);
        }
        if let Some(publisher) = &tags.publisher {
            tag.set_text("TPUB", publisher);
        }
        if let Some(language) = &tags.language {
            tag.set_text("TLAN", language);
        }
        if let Some(year) = tags.year {
            tag.set_year(year);
        }
        tag.set_genre("Audiobook");
        if let Some(description) = &tags.description {
            tag.add_frame(Comment {
                lang: "eng".to_string(),
                description: String::new(),
                text: description.clone(),
            });
        }
        if let Some((n, total)) = tags.track {
            tag.set_track(n);
            tag.set_total_tracks(total);
        }
        if let Some(cover) = &tags.cover {
            tag.add_frame(Picture {
                mime_type: cover.mime_type.clone(),
                picture_type: PictureType::CoverFront,
                description: String::new(),
                data: cover.data.clone(),
            });
        }

        if !tags.chapters.is_empty() {
            let mut elements = Vec::with_capacity(tags.chapters.len());
            for (i, mark) in tags.chapters.iter().enumerate() {
                let element_id = format!("ch{i:04}");
                tag.add_frame(Chapter {
                    element_id: element_id.clone(),
                    start_time: millis(mark.start),
                    end_time: millis(mark.end),
                    start_offset: u32::MAX,
                    end_offset: u32::MAX,
                    frames: vec![id3::Frame::text("TIT2", mark.title.clone())],
                });
                elements.push(element_id);
            }
            tag.add_frame(TableOfContents {
                element_id: "toc".to_string(),
                top_level: true,
                ordered: true,
                elements,
                frames: Vec::new(),
            });
        }

        tag.write_to_path(path, Version::Id3v24)
            .map_err(|e| Error::Audio(format!("cannot tag {}: {e}", path.display())))
    }
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub samples: u32,
    pub sample_rate: u32,
}

const BITRATES_V1_L1: [u32; 15] = [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const BITRATES_V1_L2: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const BITRATES_V1_L3: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L1: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const BITRATES_V2_L23: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

impl FrameHeader {
    /// Parses an MPEG audio frame header. Free-format frames are not
    /// supported.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let [b0, b1, b2, _, ..] = *bytes else {
            return None;
        };
        if b0 != 0xFF || b1 & 0xE0 != 0xE0 {
            return None;
        }
        let version = (b1 >> 3) & 0b11;
        let layer = (b1 >> 1) & 0b11;
        let bitrate_index = (b2 >> 4) as usize;
        let rate_index = ((b2 >> 2) & 0b11) as usize;
        let padding = ((b2 >> 1) & 1) as u32;
        if version == 1 || layer == 0 || bitrate_index == 0 || bitrate_index == 15 || rate_index == 3
        {
            return None;
        }

        let mpeg1 = version == 3;
        let sample_rate = match version {
            3 => [44100, 48000, 32000][rate_index],
            2 => [22050, 24000, 16000][rate_index],
            _ => [11025, 12000, 8000][rate_index],
        };
        let kbps = match (mpeg1, layer) {
            (true, 3) => BITRATES_V1_L1[bitrate_index],
            (true, 2) => BITRATES_V1_L2[bitrate_index],
            (true, _) => BITRATES_V1_L3[bitrate_index],
            (false, 3) => BITRATES_V2_L1[bitrate_index],
            (false, _) => BITRATES_V2_L23[bitrate_index],
        };
        let bitrate = kbps * 1000;

        let (length, samples) = match layer {
            3 => ((12 * bitrate / sample_rate + padding) * 4, 384),
            2 => (144 * bitrate / sample_rate + padding, 1152),
            _ if mpeg1 => (144 * bitrate / sample_rate + padding, 1152),
            _ => (72 * bitrate / sample_rate + padding, 576),
        };
        (length >= 4).then_some(Self {
            length: length as usize,
            samples,
            sample_rate,
        })
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples as f64 / self.sample_rate as f64)
    }
}

struct FrameScan {
    /// Bytes covered by complete frames.
    length: usize,
    duration: Duration,
}

/// Unparsed bytes tolerated after the last frame, e.g. a cut-off final frame.
const MAX_TRAILING_BYTES: usize = 4096;

/// Walks the frames of `audio` up to the end of the stream. Zero padding
/// after the last frame is ignored; anything else longer than
/// [`MAX_TRAILING_BYTES`] is an error.
fn scan_frames(audio: &[u8]) -> Result<FrameScan, String> {
    let mut offset = 0;
    let mut frames = 0u64;
    let mut duration = Duration::ZERO;
    while let Some(header) = FrameHeader::parse(&audio[offset..]) {
        if offset + header.length > audio.len() {
            break;
        }
        offset += header.length;
        frames += 1;
        duration += header.duration();
    }
    if frames == 0 {
        return Err("no MPEG audio frame at the start of the stream".into());
    }
    let trailing = &audio[offset..];
    if trailing.len() > MAX_TRAILING_BYTES && trailing.iter().any(|b| *b != 0) {
        return Err(format!(
            "{} bytes after frame {frames} are not MPEG audio",
            trailing.len()
        ));
    }
    Ok(FrameScan {
        length: offset,
        duration,
    })
}

/// Drops a leading ID3v2 tag and a trailing ID3v1 tag.
pub fn strip_tags(bytes: &[u8]) -> &[u8] {
    let mut audio = bytes;
    if audio.len() >= 10 && &audio[..3] == b"ID3" {
        let size = audio[6..10]
            .iter()
            .fold(0usize, |acc, b| (acc << 7) | (*b & 0x7F) as usize);
        let footer = if audio[5] & 0x10 != 0 { 10 } else { 0 };
        let end = (10 + size + footer).min(audio.len());
        audio = &audio[end..];
    }
    if audio.len() >= 128 && &audio[audio.len() - 128..audio.len() - 125] == b"TAG" {
        audio = &audio[..audio.len() - 128];
    }
    audio
}

/// Chapter marks at the start of every segment. `durations` are consecutive.
pub fn chapter_marks(titles: &[String], durations: &[Duration]) -> Vec<ChapterMark> {
    let mut start = Duration::ZERO;
    titles
        .iter()
        .zip(durations)
        .map(|(title, duration)| {
            let mark = ChapterMark {
                title: title.clone(),
                start,
                end: start + *duration,
            };
            start += *duration;
            mark
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioOptions {
    /// Merge all parts into one file.
    pub merge: bool,
    /// Write chapter frames.
    pub chapters: bool,
}

/// Turns downloaded segments into the final audio files.
#[derive(Clone)]
pub struct AudioAssembler {
    merger: Arc<dyn AudioMerger>,
    tagger: Arc<dyn AudioTagger>,
}

impl Default for AudioAssembler {
    fn default() -> Self {
        Self::new(Arc::new(Mp3Concat), Arc::new(Id3Tagger))
    }
}

impl AudioAssembler {
    pub fn new(merger: Arc<dyn AudioMerger>, tagger: Arc<dyn AudioTagger>) -> Self {
        Self { merger, tagger }
    }

    /// Writes the audio files for `segments` into `dir` and returns their
    /// paths. Runs on a blocking thread.
    pub async fn assemble(
        &self,
        segments: Vec<AudioSegment>,
        tags: AudioTags,
        options: AudioOptions,
        dir: &Path,
        file_stem: &str,
    ) -> Res<Vec<PathBuf>> {
        if segments.is_empty() {
            return Err(Error::IncompleteAssembly("no audio parts".into()));
        }
        let this = self.clone();
        let dir = dir.to_path_buf();
        let file_stem = file_stem.to_string();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
            if options.merge {
                this.write_merged(&segments, tags, options, &dir, &file_stem)
                    .map(|p| vec![p])
            } else {
                this.write_separate(&segments, tags, options, &dir, &file_stem)
            }
        })
        .await
        .map_err(|e| Error::Audio(e.to_string()))?
    }

    fn write_merged(
        &self,
        segments: &[AudioSegment],
        mut tags: AudioTags,
        options: AudioOptions,
        dir: &Path,
        file_stem: &str,
    ) -> Res<PathBuf> {
        let dest = dir.join(format!("{file_stem}.mp3"));
        let tmp = temp_audio(dir)?;
        let paths: Vec<PathBuf> = segments.iter().map(|s| s.path.clone()).collect();
        let measured = self.merger.merge(&paths, tmp.path())?;

        if options.chapters {
            let announced: Option<Vec<Duration>> = segments.iter().map(|s| s.duration).collect();
            let durations = match announced {
                Some(d) if d.iter().all(|d| !d.is_zero()) => d,
                _ => measured,
            };
            tags.chapters = chapter_marks(&segment_titles(segments), &durations);
        }
        self.tagger.write_tags(tmp.path(), &tags)?;

        tmp.persist(&dest).map_err(|e| Error::io(&dest, e.error))?;
        tracing::debug!(path = %dest.display(), parts = segments.len(), "merged audio written");
        Ok(dest)
    }

    fn write_separate(
        &self,
        segments: &[AudioSegment],
        tags: AudioTags,
        options: AudioOptions,
        dir: &Path,
        file_stem: &str,
    ) -> Res<Vec<PathBuf>> {
        let durations = segments
            .iter()
            .map(|s| self.merger.probe(&s.path))
            .collect::<Res<Vec<_>>>()?;
        let titles = segment_titles(segments);
        let total = segments.len() as u32;

        let mut written = Vec::with_capacity(segments.len());
        for (i, segment) in segments.iter().enumerate() {
            let number = i as u32 + 1;
            let dest = dir.join(format!("{file_stem} - Part {number:02}.mp3"));
            let tmp = temp_audio(dir)?;
            self.merger
                .merge(std::slice::from_ref(&segment.path), tmp.path())?;

            let mut part_tags = tags.clone();
            part_tags.title = titles[i].clone();
            part_tags.track = Some((number, total));
            if options.chapters {
                part_tags.chapters = chapter_marks(&titles[i..=i], &durations[i..=i]);
            }
            self.tagger.write_tags(tmp.path(), &part_tags)?;
            tmp.persist(&dest).map_err(|e| Error::io(&dest, e.error))?;
            written.push(dest);
        }
        Ok(written)
    }
}

fn segment_titles(segments: &[AudioSegment]) -> Vec<String> {
    segments
        .iter()
        .enumerate()
        .map(|(i, s)| {
            s.title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("Part {:02}", i + 1))
        })
        .collect()
}

fn temp_audio(dir: &Path) -> Res<tempfile::NamedTempFile> {
    tempfile::Builder::new()
        .prefix(".loancli-")
        .suffix(".mp3.tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::io(dir, e))
}

/// Best-effort MIME type of a cover image.
pub fn cover_image(bytes: Vec<u8>, hint: &str) -> CoverImage {
    let mime_type = if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        "image/jpeg"
    } else {
        utils::guess_media_type(hint)
    };
    CoverImage {
        mime_type: mime_type.to_string(),
        data: bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: [u8; 4] = [0xFF, 0xFB, 0x90, 0x00];

    fn frames(n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.extend_from_slice(&FRAME);
            out.extend(std::iter::repeat_n(0u8, 413));
        }
        out
    }

    #[test]
    fn parses_mpeg1_layer3_header() {
        let header = FrameHeader::parse(&FRAME).unwrap();
        assert_eq!(header.length, 417);
        assert_eq!(header.samples, 1152);
        assert_eq!(header.sample_rate, 44100);
    }

    #[test]
    fn rejects_non_audio() {
        assert!(FrameHeader::parse(b"<html>").is_none());
        assert!(scan_frames(b"not audio at all").is_err());
    }

    #[test]
    fn strips_id3v2_and_id3v1() {
        let mut data = b"ID3\x04\x00\x00\x00\x00\x00\x05hello".to_vec();
        data.extend(frames(2));
        let mut v1 = b"TAG".to_vec();
        v1.resize(128, 0);
        data.extend(v1);

        let audio = strip_tags(&data);
        assert_eq!(audio.len(), 2 * 417);
        let scan = scan_frames(audio).unwrap();
        assert_eq!(scan.length, 834);
    }

    #[test]
    fn tolerates_short_tail_and_padding() {
        let mut audio = frames(3);
        audio.extend_from_slice(&FRAME);
        audio.extend(std::iter::repeat_n(0u8, 100));
        let scan = scan_frames(&audio).unwrap();
        assert_eq!(scan.length, 3 * 417);

        let mut padded = frames(2);
        padded.extend(std::iter::repeat_n(0u8, 10_000));
        assert_eq!(scan_frames(&padded).unwrap().length, 834);
    }

    #[test]
    fn merge_rejects_segment_with_corrupt_tail() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.mp3");
        let corrupt = dir.path().join("corrupt.mp3");
        std::fs::write(&good, frames(4)).unwrap();
        let mut bytes = frames(1);
        bytes.extend(std::iter::repeat_n(0x41u8, 50_000));
        std::fs::write(&corrupt, bytes).unwrap();

        let dest = dir.path().join("merged.mp3");
        let result = Mp3Concat.merge(&[good.clone(), corrupt.clone()], &dest);
        assert!(matches!(result, Err(Error::Audio(_))));
        assert!(Mp3Concat.probe(&corrupt).is_err());
        assert_eq!(Mp3Concat.probe(&good).unwrap().as_millis(), 104);
    }

    #[test]
    fn chapter_marks_are_cumulative() {
        let marks = chapter_marks(
            &["A".into(), "B".into(), "C".into()],
            &[
                Duration::from_secs(10),
                Duration::from_secs(5),
                Duration::from_secs(7),
            ],
        );
        let starts: Vec<u64> = marks.iter().map(|m| m.start.as_secs()).collect();
        assert_eq!(starts, vec![0, 10, 15]);
        assert_eq!(marks[2].end, Duration::from_secs(22));
    }
}
