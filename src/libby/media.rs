//! Descriptive title records from the media service.
//!
//! The media service (Thunder) describes a title independently of any loan:
//! creators with their roles, series, identifiers per format, cover images
//! in several sizes and languages. Downloads use it to enrich tags and OPF
//! sidecars; a failing lookup only degrades the metadata.

use tracing::instrument;

use crate::{
    Res,
    libby::{LibbyClient, check_status},
    types::Media,
};

impl LibbyClient {
    /// Fetches the media record of a title.
    ///
    /// The media service is public, so no credentials are sent.
    ///
    /// # Arguments
    ///
    /// * `title_id` - Title id as found on the loan record
    ///
    /// # Returns
    ///
    /// The parsed [`Media`] record, or [`crate::Error::Status`] when the
    /// service does not know the title.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let media = client.media(loan.id()).await?;
    /// println!("{} by {}", media.title, media.authors().join(", "));
    /// ```
    #[instrument(skip(self))]
    pub async fn media(&self, title_id: &str) -> Res<Media> {
        let url = format!(
            "{}/media/{}",
            self.config.thunder_api_url.trim_end_matches('/'),
            title_id
        );
        let response = self
            .http
            .get(&url)
            .query(&[("x-client-id", "dewey")])
            .send()
            .await?;
        let media = check_status(response).await?.json::<Media>().await?;
        Ok(media)
    }
}

impl Media {
    /// Creators with the given role, e.g. `Author` or `Narrator`.
    pub fn creators_with_role(&self, role: &str) -> Vec<&str> {
        self.creators
            .iter()
            .filter(|c| {
                c.role
                    .as_deref()
                    .is_some_and(|r| r.eq_ignore_ascii_case(role))
            })
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Authors, falling back to the first creator when no role says so.
    pub fn authors(&self) -> Vec<&str> {
        let authors = self.creators_with_role("Author");
        if authors.is_empty() {
            self.creators.first().map(|c| c.name.as_str()).into_iter().collect()
        } else {
            authors
        }
    }

    /// First ISBN across all formats.
    pub fn isbn(&self) -> Option<&str> {
        self.formats
            .iter()
            .flat_map(|f| f.identifiers.iter())
            .find(|i| i.kind.eq_ignore_ascii_case("ISBN"))
            .map(|i| i.value.as_str())
    }

    pub fn series_name(&self) -> Option<&str> {
        self.detailed_series
            .as_ref()
            .and_then(|s| s.series_name.as_deref())
            .or(self.series.as_deref())
    }

    pub fn reading_order(&self) -> Option<&str> {
        self.detailed_series
            .as_ref()
            .and_then(|s| s.reading_order.as_deref())
    }

    /// Largest available cover.
    pub fn cover_url(&self) -> Option<&str> {
        ["cover510Wide", "cover300Wide", "cover150Wide", "cover"]
            .iter()
            .find_map(|key| self.covers.get(*key))
            .and_then(|c| c.href.as_deref())
    }

    pub fn language(&self) -> Option<&str> {
        self.languages.first().map(|l| l.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Media {
        serde_json::from_value(json!({
            "id": 9999999,
            "title": "Test Title",
            "creators": [
                {"name": "Jane Narrator", "role": "Narrator"},
                {"name": "John Writer", "role": "Author", "sortName": "Writer, John"}
            ],
            "detailedSeries": {"seriesName": "Series", "readingOrder": 2},
            "formats": [
                {"id": "audiobook-mp3", "identifiers": [{"type": "ISBN", "value": "9780000000001"}]}
            ],
            "covers": {"cover300Wide": {"href": "http://localhost/c300.jpg"}},
            "languages": [{"id": "en", "name": "English"}]
        }))
        .unwrap()
    }

    #[test]
    fn reads_media_fields() {
        let media = sample();
        assert_eq!(media.id.as_deref(), Some("9999999"));
        assert_eq!(media.authors(), vec!["John Writer"]);
        assert_eq!(media.creators_with_role("narrator"), vec!["Jane Narrator"]);
        assert_eq!(media.isbn(), Some("9780000000001"));
        assert_eq!(media.series_name(), Some("Series"));
        assert_eq!(media.reading_order(), Some("2"));
        assert_eq!(media.cover_url(), Some("http://localhost/c300.jpg"));
        assert_eq!(media.language(), Some("en"));
    }
}
