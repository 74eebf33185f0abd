// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

pub mod certs;
pub mod check;
pub mod fetcher;
pub mod hosts;
pub mod output;
pub mod payload;
pub mod runner;
pub mod scanner;
pub mod validation;
