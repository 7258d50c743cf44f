//! Form body encoders.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// `application/x-www-form-urlencoded` encoding of `fields`
pub fn urlencoded(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

enum Part {
    Field { name: String, value: String },
    File { name: String, filename: String, data: Bytes },
}

/// `multipart/form-data` body builder
pub struct MultipartForm {
    boundary: String,
    parts: Vec<Part>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    pub fn new() -> Self {
        Self {
            boundary: format!("-------------{}", Uuid::new_v4().simple()),
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part::Field {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn file(mut self, name: impl Into<String>, filename: impl Into<String>, data: Bytes) -> Self {
        self.parts.push(Part::File {
            name: name.into(),
            filename: filename.into(),
            data,
        });
        self
    }

    /// Content type header value and the encoded body
    pub fn finish(self) -> (String, Bytes) {
        let mut body = BytesMut::new();
        for part in &self.parts {
            body.put_slice(format!("--{}\r\n", self.boundary).as_bytes());
            match part {
                Part::Field { name, value } => {
                    body.put_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                            .as_bytes(),
                    );
                    body.put_slice(value.as_bytes());
                }
                Part::File { name, filename, data } => {
                    body.put_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.put_slice(data);
                }
            }
            body.put_slice(b"\r\n");
        }
        body.put_slice(format!("--{}--\r\n", self.boundary).as_bytes());

        (
            format!("multipart/form-data; boundary={}", self.boundary),
            body.freeze(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoded_escapes_values() {
        let body = urlencoded(&[("purge", "http://a.com/x y\n"), ("k", "v")]);
        assert_eq!(body, "purge=http%3A%2F%2Fa.com%2Fx%20y%0A&k=v");
    }

    #[test]
    fn multipart_body_layout() {
        let form = MultipartForm::new()
            .text("policy", "abc")
            .file("file", "cat.jpg", Bytes::from_static(b"\r\nbinary\r\n"));
        let boundary = form.boundary().to_string();
        let (content_type, body) = form.finish();

        assert_eq!(content_type, format!("multipart/form-data; boundary={boundary}"));
        let expected = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"policy\"\r\n\r\nabc\r\n\
             --{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"cat.jpg\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\r\nbinary\r\n\r\n\
             --{boundary}--\r\n"
        );
        assert_eq!(String::from_utf8_lossy(&body), expected);
    }
}
