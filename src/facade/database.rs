use super::Collection;
use crate::Client;
use crate::core::Namespace;
use crate::gridfs::{GridFsBucket, GridFsBucketOptions};

/// Handle to a named database. Creating one performs no I/O.
#[derive(Clone, Debug)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.client.clone(), Namespace::new(&self.name, name))
    }

    /// GridFS bucket stored in `<bucket>.files` and `<bucket>.chunks`
    ///
    /// # Examples
    ///
    /// ```
    /// # use docmotor::{Client, GridFsBucketOptions};
    /// let client = Client::in_memory();
    /// let bucket = client
    ///     .database("media")
    ///     .gridfs_bucket(Some(GridFsBucketOptions::new().bucket_name("images")));
    /// assert_eq!(bucket.bucket_name(), "images");
    /// ```
    pub fn gridfs_bucket(&self, options: Option<GridFsBucketOptions>) -> GridFsBucket {
        GridFsBucket::new(self.clone(), options.unwrap_or_default())
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        self.client == other.client && self.name == other.name
    }
}
